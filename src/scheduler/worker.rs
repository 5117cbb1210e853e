//! Task Runners
//!
//! One `TaskRunner` per worker slot. Each runner thread loops: wait for the
//! run queue to be non-empty, pop the computer with the least virtual
//! runtime, bind it, run one slice, and report completion. Everything else
//! (timeout policy, abort escalation, replacement) belongs to the monitor.
//!
//! # Slice protocol
//!
//! ```text
//!   await_work ──► bind (CAS) ──► before_work ──► publish ──► work()
//!                    │ lost                         │
//!                    ▼                              ▼
//!              log + refuse              completion clause: take
//!              next task                 current_executor, after_work
//! ```
//!
//! Two orderings here are load-bearing:
//!
//! - `current_executor` is published only *after* `before_work` reset the
//!   slice timers, so the monitor never times an un-timed executor.
//! - The completion clause runs on every exit path (success, guest error,
//!   guest panic) and takes the cell atomically, so exactly one of the
//!   worker and the monitor performs `after_work` for a slice.
//!
//! # Interrupts
//!
//! Threads cannot be interrupted, so each runner carries an interrupt flag;
//! raising it wakes the `has_work` waiters and the runner abandons that wait
//! iteration. Code blocked inside `work()` is beyond the flag's reach; that
//! is the monitor's escalation staircase, not ours. Waits carry a bounded
//! timeout as a backstop so a lost wakeup cannot park a runner forever.

use std::any::Any;
use std::fmt::Write as _;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tracing::{error, warn};

use super::clock::monotonic_nanos;
use super::core::{RunnerSlot, Shared};
use super::executor::ExecutorHandle;

/// Backstop for `has_work` waits. Interrupts and admissions notify the
/// condvar, so this only bounds the damage of a lost wakeup.
const WAIT_BACKSTOP: Duration = Duration::from_millis(100);

/// Process-global switch for timeout reports.
static TIMEOUT_REPORTS: AtomicBool = AtomicBool::new(true);

/// Source for worker ids and thread-name numbers. Replacement workers get
/// fresh numbers, so a name always denotes one thread.
static NEXT_WORKER: AtomicU64 = AtomicU64::new(0);

/// Enable or disable timeout reports process-wide. Reports are on by
/// default; hosts drowning in misbehaving-computer logs can turn them off.
pub fn set_timeout_reports(enabled: bool) {
    TIMEOUT_REPORTS.store(enabled, Ordering::Relaxed);
}

fn timeout_reports_enabled() -> bool {
    TIMEOUT_REPORTS.load(Ordering::Relaxed)
}

/// Shared state of one worker slot.
///
/// The monitor reads `current` and the flags without any scheduler lock;
/// `current` is a small mutex cell used as an atomic take/compare-and-take.
pub(crate) struct TaskRunner {
    /// Unique worker id, stored in executors' `executing_worker` cells.
    pub(crate) id: u64,
    /// Thread name, `Computer-Runner-<id>`.
    pub(crate) name: String,
    /// Keep-going flag for this runner specifically. Cleared on `stop` and
    /// when the monitor abandons the runner.
    pub(crate) running: AtomicBool,
    /// Interrupt flag; consumed by the runner at its next wait check.
    pub(crate) interrupted: AtomicBool,
    /// The executor this runner is currently executing, if any. Published
    /// after `before_work`, taken by the completion clause or the monitor.
    current: Mutex<Option<Arc<ExecutorHandle>>>,
    /// Monotonic nanos of the last emitted timeout report, for debouncing.
    last_report: Mutex<Option<i64>>,
}

impl TaskRunner {
    fn new() -> Self {
        let id = NEXT_WORKER.fetch_add(1, Ordering::Relaxed);
        Self {
            id,
            name: format!("Computer-Runner-{id}"),
            running: AtomicBool::new(true),
            interrupted: AtomicBool::new(false),
            current: Mutex::new(None),
            last_report: Mutex::new(None),
        }
    }

    /// The bound executor, if any.
    pub(crate) fn current_executor(&self) -> Option<Arc<ExecutorHandle>> {
        self.current.lock().expect("runner cell poisoned").clone()
    }

    /// Take the bound executor if it is still `expected`. Used by the
    /// monitor when abandoning a runner, so a slice the worker finished (and
    /// a successor it bound) in the meantime is left alone.
    pub(crate) fn take_current_if(
        &self,
        expected: &Arc<ExecutorHandle>,
    ) -> Option<Arc<ExecutorHandle>> {
        let mut cell = self.current.lock().expect("runner cell poisoned");
        if cell
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, expected))
        {
            cell.take()
        } else {
            None
        }
    }

    /// Consume the interrupt flag.
    fn take_interrupt(&self) -> bool {
        self.interrupted.swap(false, Ordering::AcqRel)
    }

    /// Emit a timeout diagnostic for `executor`, debounced per runner.
    pub(crate) fn report_timeout(&self, shared: &Shared, executor: &ExecutorHandle, elapsed: i64) {
        if !timeout_reports_enabled() {
            return;
        }

        let now = monotonic_nanos();
        {
            let mut last = self.last_report.lock().expect("report clock poisoned");
            let debounce = shared.cfg.report_debounce.as_nanos() as i64;
            if last.is_some_and(|previous| now - previous - debounce <= 0) {
                return;
            }
            *last = Some(now);
        }
        shared.metrics.record_timeout_report();

        let mut report = String::new();
        let _ = writeln!(
            report,
            "Terminating computer #{} due to timeout (running for {:.2} seconds). \
             This is NOT a bug, but may mean a computer is misbehaving.",
            executor.id(),
            elapsed as f64 * 1e-9,
        );
        let _ = writeln!(
            report,
            "Worker {} is currently running={} interrupted={}",
            self.name,
            self.running.load(Ordering::Acquire),
            self.interrupted.load(Ordering::Acquire),
        );
        executor.executor().print_state(&mut report);

        warn!(computer = executor.id(), worker = %self.name, "{}", report.trim_end());
    }
}

/// Spawn a fresh runner thread.
///
/// Called under the thread-table mutex (from `start` and the monitor's
/// replacement paths).
pub(crate) fn spawn_runner(shared: &Arc<Shared>) -> RunnerSlot {
    let runner = Arc::new(TaskRunner::new());
    let thread = thread::Builder::new()
        .name(runner.name.clone())
        .spawn({
            let shared = Arc::clone(shared);
            let runner = Arc::clone(&runner);
            move || run_worker(&shared, &runner)
        })
        .expect("failed to spawn worker thread");
    RunnerSlot { runner, thread }
}

/// Park until work is available, then pop the minimum-runtime executor.
///
/// Returns `None` when the wait was abandoned (interrupt or stop); the outer
/// loop re-checks the running flags and either exits or retries.
fn await_work(shared: &Shared, runner: &TaskRunner) -> Option<Arc<ExecutorHandle>> {
    let mut state = shared.sched.lock().expect("scheduler mutex poisoned");
    shared.idle_workers.fetch_add(1, Ordering::AcqRel);

    let popped = loop {
        if runner.take_interrupt()
            || !runner.running.load(Ordering::Acquire)
            || !shared.running.load(Ordering::Acquire)
        {
            break None;
        }
        if let Some(executor) = state.queue.pop_min() {
            break Some(executor);
        }
        let (guard, _timed_out) = shared
            .has_work
            .wait_timeout(state, WAIT_BACKSTOP)
            .expect("scheduler mutex poisoned");
        state = guard;
    };

    shared.idle_workers.fetch_sub(1, Ordering::AcqRel);
    popped
}

/// The worker thread body.
pub(crate) fn run_worker(shared: &Arc<Shared>, runner: &Arc<TaskRunner>) {
    while runner.running.load(Ordering::Acquire) && shared.running.load(Ordering::Acquire) {
        let Some(executor) = await_work(shared, runner) else {
            continue;
        };

        // Running a computer someone else is already running means something
        // is seriously wrong; refuse and move on. The owning worker will
        // complete and requeue it.
        if let Err(owner) = executor.bind(runner.id) {
            error!(
                computer = executor.id(),
                worker = %runner.name,
                bound_to = owner,
                "computer is already running on another worker; this is a SERIOUS bug"
            );
            shared.metrics.record_bind_refused();
            continue;
        }

        // Reset the timers, then publish. The monitor must never observe a
        // bound executor whose slice clock has not started.
        executor.before_work();
        *runner.current.lock().expect("runner cell poisoned") = Some(Arc::clone(&executor));

        match panic::catch_unwind(AssertUnwindSafe(|| executor.executor().work())) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                shared.metrics.record_work_error();
                error!(
                    computer = executor.id(),
                    error = %err,
                    "error running computer task; failing the computer"
                );
                // No guarantee the machine is well behaved from now on.
                executor.executor().fast_fail();
            }
            Err(payload) => {
                shared.metrics.record_work_error();
                error!(
                    computer = executor.id(),
                    panic = panic_message(payload.as_ref()),
                    "panic running computer task; failing the computer"
                );
                executor.executor().fast_fail();
            }
        }
        shared.metrics.record_slice();

        // Completion clause: runs on every exit path. The monitor may have
        // drained the cell already if it abandoned this runner.
        let finished = runner.current.lock().expect("runner cell poisoned").take();
        if let Some(done) = finished {
            shared.after_work(runner, &done);
        }
    }
}

/// Best-effort extraction of a panic payload's message.
fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "<non-string panic payload>"
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::super::core::Scheduler;
    use super::super::executor_stub::{StubExecutor, StubWork};
    use super::super::executor::Executor;
    use super::*;

    fn wait_until(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        done()
    }

    #[test]
    fn runs_all_events_of_one_computer() {
        let scheduler = Scheduler::new(1);
        scheduler.start();

        let stub = Arc::new(StubExecutor::with_events(
            &scheduler,
            1,
            StubWork::Sleep(Duration::from_millis(1)),
            3,
        ));
        let handle = ExecutorHandle::new(Arc::clone(&stub) as Arc<dyn Executor>);
        scheduler.queue(&handle);

        assert!(wait_until(Duration::from_secs(5), || stub.completions() == 3));
        assert_eq!(stub.runs(), 3);
        assert!(!handle.on_queue());
        assert_eq!(handle.executing_worker(), None);
        assert!(scheduler.metrics().slices_executed >= 3);

        scheduler.stop();
    }

    #[test]
    fn worker_survives_guest_panic_and_error() {
        let scheduler = Scheduler::new(1);
        scheduler.start();

        let panicking = Arc::new(StubExecutor::new(
            &scheduler,
            1,
            StubWork::Panic("boom".to_string()),
        ));
        scheduler.queue(&ExecutorHandle::new(Arc::clone(&panicking) as Arc<dyn Executor>));

        let failing = Arc::new(StubExecutor::new(
            &scheduler,
            2,
            StubWork::Fail("cartridge on fire".to_string()),
        ));
        scheduler.queue(&ExecutorHandle::new(Arc::clone(&failing) as Arc<dyn Executor>));

        let healthy = Arc::new(StubExecutor::new(
            &scheduler,
            3,
            StubWork::Sleep(Duration::from_millis(1)),
        ));
        scheduler.queue(&ExecutorHandle::new(Arc::clone(&healthy) as Arc<dyn Executor>));

        // The same single worker must outlive both failures and still run
        // the healthy computer.
        assert!(wait_until(Duration::from_secs(5), || healthy.completions() == 1));
        assert_eq!(panicking.fast_fails(), 1);
        assert_eq!(failing.fast_fails(), 1);
        let metrics = scheduler.metrics();
        assert_eq!(metrics.work_errors, 2);
        assert_eq!(metrics.workers_replaced, 0);

        scheduler.stop();
    }

    #[test]
    fn virtual_runtime_accumulates_while_running() {
        let scheduler = Scheduler::new(1);
        scheduler.start();

        let stub = Arc::new(StubExecutor::with_events(
            &scheduler,
            1,
            StubWork::Sleep(Duration::from_millis(5)),
            4,
        ));
        let handle = ExecutorHandle::new(Arc::clone(&stub) as Arc<dyn Executor>);
        scheduler.queue(&handle);
        let admitted = handle.virtual_runtime();

        assert!(wait_until(Duration::from_secs(5), || stub.completions() == 4));
        assert!(handle.virtual_runtime() > admitted);

        scheduler.stop();
    }
}
