//! Executor Contract
//!
//! # Purpose
//!
//! These types represent a computer's executor as seen by the scheduler. The
//! virtual machine behind each executor is a black box; the [`Executor`]
//! trait defines the contract, and [`ExecutorHandle`] carries the scheduling
//! state the scheduler owns on its behalf.
//!
//! # Ownership Split
//!
//! ```text
//!   ExecutorHandle (scheduler-owned)        dyn Executor (guest-owned)
//!   ┌────────────────────────────┐          ┌─────────────────────────┐
//!   │ virtual_runtime            │          │ work()                  │
//!   │ v_runtime_start            │  ──────► │ after_work() -> requeue │
//!   │ on_queue                   │          │ abort() / fast_fail()   │
//!   │ executing_worker (CAS)     │          │ print_state() / id()    │
//!   │ seq (queue tiebreak)       │          │ timeout(): TimeoutState │
//!   └────────────────────────────┘          └─────────────────────────┘
//! ```
//!
//! The two halves share one reference-counted allocation, so an executor has
//! stable identity across admissions.
//!
//! # Correctness Invariants
//!
//! - `virtual_runtime` is monotone non-decreasing while the executor is
//!   scheduled, and is only written under the scheduler mutex.
//! - `on_queue` is flipped exclusively by [`RunQueue`](super::run_queue::RunQueue).
//! - At most one worker wins the unbound → bound transition of
//!   `executing_worker`; losing the race is a serious bug in the caller and
//!   is logged, never silently tolerated.
//! - Callbacks must not re-enter [`Scheduler::queue`](super::core::Scheduler::queue)
//!   for the same executor while it is bound; the caller-held enqueue lock
//!   enforces this.

use std::error::Error;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use super::clock::monotonic_nanos;
use super::timeout::TimeoutState;

/// Error returned by [`Executor::work`].
///
/// Guest failures are arbitrary (VM faults, load errors, script errors), so
/// the seam uses a boxed error. The scheduler only logs it and tears the
/// computer down via [`Executor::fast_fail`]; it never inspects the payload.
pub type WorkError = Box<dyn Error + Send + Sync + 'static>;

/// The capability interface a computer's executor exposes to the scheduler.
///
/// # Threading
///
/// `work`, `after_work` and the timer hooks are invoked from worker threads;
/// `abort` and [`TimeoutState::refresh`] from the monitor thread. `after_work`
/// runs under the scheduler mutex and must stay short.
pub trait Executor: Send + Sync {
    /// Guest hook invoked once per slice, after the slice timers reset and
    /// before `work`.
    fn before_work(&self) {}

    /// Run one event slice. Blocking is permitted; the monitor bounds it.
    ///
    /// An `Err` (or a panic) tears the computer down via `fast_fail` and is
    /// never propagated past the worker.
    fn work(&self) -> Result<(), WorkError>;

    /// Completion hook. Returns true if the executor has more work and
    /// should be requeued.
    fn after_work(&self) -> bool;

    /// Non-cooperative termination request, issued by the monitor alongside
    /// the hard-abort flag.
    fn abort(&self);

    /// Tear the computer down immediately after a failed slice. There is no
    /// guarantee the machine is well behaved from now on.
    fn fast_fail(&self);

    /// Append a human-readable state dump to `out` (used by timeout reports).
    fn print_state(&self, out: &mut String);

    /// Stable computer id, used in diagnostics.
    fn id(&self) -> u64;

    /// The executor's timeout state. Owned by the guest, driven by the
    /// scheduler and the monitor.
    fn timeout(&self) -> &TimeoutState;
}

/// Sentinel stored in the `executing_worker` cell while no worker holds the
/// executor. Not a valid worker id: worker ids are assigned sequentially
/// from zero and will never reach `u64::MAX`.
const UNBOUND: u64 = u64::MAX;

/// Source for the per-handle queue tiebreak sequence.
static NEXT_SEQ: AtomicU64 = AtomicU64::new(0);

/// The schedulable entity: one guest executor plus the scheduling state the
/// scheduler owns for it.
///
/// Admission, accounting and the run queue all operate on
/// `Arc<ExecutorHandle>`; the `Arc` is the executor's identity.
pub struct ExecutorHandle {
    executor: Arc<dyn Executor>,

    /// Stable tiebreak for the run-queue ordering. Unique per handle, so
    /// distinct executors never compare equal.
    seq: u64,

    /// Cumulative fair-share time in nanoseconds. Guarded by the scheduler
    /// mutex; atomic only so the handle stays `Sync`.
    virtual_runtime: AtomicI64,

    /// Monotonic timestamp at which the current slice began. Meaningful only
    /// while bound to a worker.
    v_runtime_start: AtomicI64,

    /// Run-queue membership flag. Flipped by `RunQueue` under the scheduler
    /// mutex.
    on_queue: AtomicBool,

    /// Id of the worker currently bound to this executor, or [`UNBOUND`].
    /// Compare-and-set cell so the monitor can read it without the scheduler
    /// mutex.
    executing_worker: AtomicU64,
}

impl ExecutorHandle {
    /// Wrap a guest executor in scheduling state.
    pub fn new(executor: Arc<dyn Executor>) -> Arc<Self> {
        Arc::new(Self {
            executor,
            seq: NEXT_SEQ.fetch_add(1, Ordering::Relaxed),
            virtual_runtime: AtomicI64::new(0),
            v_runtime_start: AtomicI64::new(0),
            on_queue: AtomicBool::new(false),
            executing_worker: AtomicU64::new(UNBOUND),
        })
    }

    /// The guest side of this executor.
    #[inline]
    pub fn executor(&self) -> &dyn Executor {
        &*self.executor
    }

    /// Stable computer id (delegates to the guest).
    #[inline]
    pub fn id(&self) -> u64 {
        self.executor.id()
    }

    /// Queue tiebreak sequence, unique per handle.
    #[inline]
    pub(crate) fn seq(&self) -> u64 {
        self.seq
    }

    /// Accumulated virtual runtime in nanoseconds.
    #[inline]
    pub fn virtual_runtime(&self) -> i64 {
        self.virtual_runtime.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn set_virtual_runtime(&self, runtime: i64) {
        self.virtual_runtime.store(runtime, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn v_runtime_start(&self) -> i64 {
        self.v_runtime_start.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn set_v_runtime_start(&self, start: i64) {
        self.v_runtime_start.store(start, Ordering::Relaxed);
    }

    /// Credit the in-flight slice up to `now`, split across `tasks`
    /// concurrent tasks, and restart the slice clock. Returns the updated
    /// virtual runtime.
    ///
    /// Must be called under the scheduler mutex.
    pub(crate) fn advance_runtime(&self, now: i64, tasks: i64) -> i64 {
        let updated = self.virtual_runtime() + (now - self.v_runtime_start()) / tasks;
        self.set_virtual_runtime(updated);
        self.set_v_runtime_start(now);
        updated
    }

    /// Whether the executor currently sits in the run queue.
    #[inline]
    pub fn on_queue(&self) -> bool {
        self.on_queue.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn set_on_queue(&self, on_queue: bool) {
        self.on_queue.store(on_queue, Ordering::Relaxed);
    }

    /// Bind this executor to `worker`.
    ///
    /// Fails with the current owner's id if another worker already holds the
    /// executor; the caller must refuse to run it.
    pub(crate) fn bind(&self, worker: u64) -> Result<(), u64> {
        match self.executing_worker.compare_exchange(
            UNBOUND,
            worker,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => Ok(()),
            Err(owner) => Err(owner),
        }
    }

    /// Clear the binding, returning the worker id that held it (if any).
    pub(crate) fn unbind(&self) -> Option<u64> {
        match self.executing_worker.swap(UNBOUND, Ordering::AcqRel) {
            UNBOUND => None,
            owner => Some(owner),
        }
    }

    /// Id of the worker currently bound to this executor, if any.
    #[inline]
    pub fn executing_worker(&self) -> Option<u64> {
        match self.executing_worker.load(Ordering::Acquire) {
            UNBOUND => None,
            owner => Some(owner),
        }
    }

    /// Reset the slice clocks and run the guest's pre-slice hook.
    ///
    /// Called by the binding worker immediately before the slice, and before
    /// the executor is published to the monitor.
    pub(crate) fn before_work(&self) {
        self.set_v_runtime_start(monotonic_nanos());
        self.executor.timeout().start_timer();
        self.executor.before_work();
    }
}

impl std::fmt::Debug for ExecutorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorHandle")
            .field("id", &self.id())
            .field("seq", &self.seq)
            .field("virtual_runtime", &self.virtual_runtime())
            .field("on_queue", &self.on_queue())
            .field("executing_worker", &self.executing_worker())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::super::core::Scheduler;
    use super::super::executor_stub::{StubExecutor, StubWork};
    use super::*;

    fn handle() -> Arc<ExecutorHandle> {
        let scheduler = Scheduler::new(1);
        ExecutorHandle::new(Arc::new(StubExecutor::new(&scheduler, 7, StubWork::Noop)))
    }

    #[test]
    fn bind_is_exclusive() {
        let h = handle();
        assert_eq!(h.executing_worker(), None);
        assert!(h.bind(3).is_ok());
        assert_eq!(h.executing_worker(), Some(3));
        // A second bind loses and learns the current owner.
        assert_eq!(h.bind(4), Err(3));
        assert_eq!(h.unbind(), Some(3));
        assert_eq!(h.executing_worker(), None);
        assert!(h.bind(4).is_ok());
    }

    #[test]
    fn unbind_when_unbound_returns_none() {
        let h = handle();
        assert_eq!(h.unbind(), None);
    }

    #[test]
    fn seq_is_unique() {
        let a = handle();
        let b = handle();
        assert_ne!(a.seq(), b.seq());
    }

    #[test]
    fn advance_runtime_splits_across_tasks() {
        let h = handle();
        h.set_virtual_runtime(1_000);
        h.set_v_runtime_start(0);
        let updated = h.advance_runtime(4_000, 4);
        assert_eq!(updated, 2_000);
        assert_eq!(h.virtual_runtime(), 2_000);
        assert_eq!(h.v_runtime_start(), 4_000);
    }
}
