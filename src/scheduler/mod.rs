//! Fair-share computer scheduler: run queue, worker pool, and monitor.
//!
//! # Overview
//!
//! This module schedules event slices for a fleet of sandboxed in-process
//! computers onto a fixed pool of worker threads. Computers are prioritised
//! by accumulated *virtual runtime* (an implementation of Linux's Completely
//! Fair Scheduler): the less fair-share time a computer has consumed, the
//! sooner it runs. A single monitor thread watches every worker and
//! terminates slices that overrun their budget, escalating from cooperative
//! flags all the way to abandoning the worker thread.
//!
//! # Architecture
//!
//! ```text
//!  producers                 ┌──────────────────────────────────────────────┐
//!  (per-computer             │                  Scheduler                   │
//!   event queues)            │                                              │
//!       │                    │   ┌──────────┐ pop_min  ┌────────────────┐   │
//!       │  queue()           │   │ RunQueue │─────────►│ Computer-Runner-0 │ │
//!       └───────────────────►│   │ (BTree,  │          ├────────────────┤   │
//!                            │   │  keyed by│─────────►│ Computer-Runner-N │ │
//!                            │   │  vruntime)          └───────┬────────┘   │
//!                            │   └──────────┘                  │ after_work │
//!                            │        ▲                        │ (requeue?) │
//!                            │        └────────────────────────┘            │
//!                            │                                              │
//!                            │   ┌──────────────────┐  refresh / abort /    │
//!                            │   │ Computer-Monitor │  interrupt / replace  │
//!                            │   └──────────────────┘                       │
//!                            └──────────────────────────────────────────────┘
//! ```
//!
//! # Module Organization
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`clock`] | Process-monotonic nanosecond clock |
//! | [`run_queue`] | Ordered multiset of runnable executors keyed by virtual runtime |
//! | [`executor`] | The [`Executor`] capability trait and [`ExecutorHandle`] scheduling state |
//! | [`timeout`] | Per-executor [`TimeoutState`]: pause / soft-abort / hard-abort flags |
//! | [`core`] | The [`Scheduler`] façade: admission, accounting, lifecycle |
//! | [`worker`] | `TaskRunner` worker threads and timeout reporting |
//! | [`monitor`] | The monitor thread and its escalation staircase |
//! | [`metrics`] | Always-on counters with a serializable snapshot |
//! | [`executor_stub`] | Deterministic stub executor for testing the scheduler in isolation |
//!
//! # Non-Negotiable Invariants
//!
//! - **Single placement**: an admitted executor is on the run queue, *or*
//!   bound to exactly one worker, *or* idle off-scheduler. Never two at once.
//! - **Queue flag agreement**: `on_queue` is true exactly while the executor
//!   sits in the run queue.
//! - **Monotone floor**: `minimum_virtual_runtime` never decreases, so a
//!   returning sleeper's priority boost is always bounded.
//! - **Bounded damage**: a runaway computer costs at most two hard-abort
//!   windows on one worker before the scheduler recovers by replacing it.
//! - **Publish-after-init**: the monitor never observes a bound executor
//!   whose slice timers have not been reset.
//!
//! # Locking
//!
//! Two long-lived locks, one order:
//!
//! - The *scheduler mutex* guards the run queue, the virtual-time floor, and
//!   both condition variables (`has_work`, `monitor_wakeup`).
//! - The *thread-table mutex* guards the worker slots and the monitor slot.
//!
//! The scheduler mutex may be held while taking the thread-table mutex
//! (virtual-time accounting walks the bound executors). The reverse order is
//! forbidden. Per-runner `current_executor` cells are innermost and are never
//! held across an acquisition of either outer lock.

pub mod clock;
pub mod core;
pub mod executor;
pub mod executor_stub;
pub mod metrics;
pub mod monitor;
pub mod run_queue;
pub mod timeout;
pub mod worker;

pub use self::core::{Scheduler, SchedulerConfig};
pub use self::executor::{Executor, ExecutorHandle, WorkError};
pub use self::executor_stub::{StubExecutor, StubWork};
pub use self::metrics::{MetricsSnapshot, SchedulerMetrics};
pub use self::run_queue::RunQueue;
pub use self::timeout::TimeoutState;
pub use self::worker::set_timeout_reports;
