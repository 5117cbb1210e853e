//! Fair-share scheduler for fleets of sandboxed in-process computers.
//!
//! A host embeds many small virtual machines ("computers"), each receiving
//! bursts of events that must be executed with low perceived latency. This
//! crate dispatches those event slices onto a bounded pool of worker threads
//! using Completely-Fair-Scheduler-style virtual-time accounting, so that a
//! malicious or buggy computer can neither starve its neighbours nor hold a
//! worker indefinitely.
//!
//! High-level flow (single slice):
//! 1) A producer admits a computer via [`Scheduler::queue`].
//! 2) A worker pops the computer with the least virtual runtime, binds it,
//!    and runs one slice bounded by [`Scheduler::scaled_period`].
//! 3) Completion accounting credits the slice and requeues the computer if
//!    more events are pending.
//! 4) A monitor thread orthogonally walks the workers and escalates runaway
//!    slices: soft abort, then hard abort, then interrupt, then worker
//!    replacement.
//!
//! See the [`scheduler`] module for the full architecture walkthrough.

pub mod scheduler;

pub use crate::scheduler::{
    set_timeout_reports, Executor, ExecutorHandle, MetricsSnapshot, RunQueue, Scheduler,
    SchedulerConfig, StubExecutor, StubWork, TimeoutState, WorkError,
};
