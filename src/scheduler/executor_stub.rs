//! Executor Stubs
//!
//! Deterministic mock executors for testing the scheduler in isolation. The
//! real virtual machine is a black box; these stubs script the behaviors the
//! scheduler must cope with: well-behaved slices, pause-cooperative long
//! events, soft-abort-cooperative hogs, hogs that ignore every flag, and
//! outright failures.
//!
//! Every interaction is counted, so tests can assert on what the scheduler
//! actually did (`runs`, `completions`, `aborts`, `fast_fails`) instead of
//! guessing from timing.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use super::core::Scheduler;
use super::executor::{Executor, WorkError};
use super::timeout::TimeoutState;

/// Upper bound on any spinning mode, so a test failure cannot wedge its
/// process on a stub that was never released.
const SPIN_SAFETY_CAP: Duration = Duration::from_secs(30);

/// Scripted behavior for one [`StubExecutor`].
#[derive(Clone, Debug)]
pub enum StubWork {
    /// Return immediately.
    Noop,
    /// Sleep for the duration, then finish the event.
    Sleep(Duration),
    /// A long event that cooperates with pausing: sleeps in `step`
    /// increments, refreshing its timeout state, and yields the slice when
    /// the pause flag rises. The event completes after `total` of work.
    YieldOnPause { step: Duration, total: Duration },
    /// Spin (sleeping in `step` increments) until the soft-abort flag
    /// rises, then terminate the event cooperatively.
    SpinUntilSoftAbort { step: Duration },
    /// Ignore every flag and spin until [`StubExecutor::release`] is
    /// called. Exists to exercise the hard-abort ladder.
    SpinUntilReleased { step: Duration },
    /// Fail the slice with an error.
    Fail(String),
    /// Panic mid-slice.
    Panic(String),
}

/// Deterministic scripted executor.
pub struct StubExecutor {
    id: u64,
    timeout: TimeoutState,
    work: StubWork,
    /// Events remaining, decremented by `after_work` on event completion.
    events: AtomicU32,
    /// Work done towards the current `YieldOnPause` event.
    progress: Mutex<Duration>,
    /// Whether the last slice ended in a pause-yield (event unfinished).
    yielded: AtomicBool,
    released: AtomicBool,
    runs: AtomicU32,
    completions: AtomicU32,
    aborts: AtomicU32,
    fast_fails: AtomicU32,
}

impl StubExecutor {
    /// Single-event stub with the standard timeout limits.
    pub fn new(scheduler: &Scheduler, id: u64, work: StubWork) -> Self {
        Self::with_events(scheduler, id, work, 1)
    }

    /// Stub with `events` queued events; `after_work` requeues until they
    /// are exhausted.
    pub fn with_events(scheduler: &Scheduler, id: u64, work: StubWork, events: u32) -> Self {
        Self::with_timeout(TimeoutState::new(scheduler), id, work, events)
    }

    /// Stub with an explicit timeout state (tests of the abort ladder use
    /// shortened limits).
    pub fn with_timeout(timeout: TimeoutState, id: u64, work: StubWork, events: u32) -> Self {
        Self {
            id,
            timeout,
            work,
            events: AtomicU32::new(events),
            progress: Mutex::new(Duration::ZERO),
            yielded: AtomicBool::new(false),
            released: AtomicBool::new(false),
            runs: AtomicU32::new(0),
            completions: AtomicU32::new(0),
            aborts: AtomicU32::new(0),
            fast_fails: AtomicU32::new(0),
        }
    }

    /// Times `work` was invoked.
    pub fn runs(&self) -> u32 {
        self.runs.load(Ordering::Acquire)
    }

    /// Events completed (pause-yields do not count).
    pub fn completions(&self) -> u32 {
        self.completions.load(Ordering::Acquire)
    }

    /// Times `abort` was invoked by the monitor.
    pub fn aborts(&self) -> u32 {
        self.aborts.load(Ordering::Acquire)
    }

    /// Times the worker tore this computer down via `fast_fail`.
    pub fn fast_fails(&self) -> u32 {
        self.fast_fails.load(Ordering::Acquire)
    }

    /// Let a `SpinUntilReleased` slice return.
    pub fn release(&self) {
        self.released.store(true, Ordering::Release);
    }
}

impl Executor for StubExecutor {
    fn work(&self) -> Result<(), WorkError> {
        self.runs.fetch_add(1, Ordering::AcqRel);
        match &self.work {
            StubWork::Noop => Ok(()),
            StubWork::Sleep(duration) => {
                thread::sleep(*duration);
                Ok(())
            }
            StubWork::YieldOnPause { step, total } => {
                let started = Instant::now();
                loop {
                    thread::sleep(*step);
                    {
                        let mut progress = self.progress.lock().expect("stub progress poisoned");
                        *progress += *step;
                        if *progress >= *total {
                            *progress = Duration::ZERO;
                            return Ok(());
                        }
                    }
                    // Safepoint: observe the pause flag and yield the slice.
                    self.timeout.refresh();
                    if self.timeout.is_paused() || self.timeout.is_soft_aborted() {
                        self.yielded.store(true, Ordering::Release);
                        return Ok(());
                    }
                    if started.elapsed() >= SPIN_SAFETY_CAP {
                        return Ok(());
                    }
                }
            }
            StubWork::SpinUntilSoftAbort { step } => {
                let started = Instant::now();
                while started.elapsed() < SPIN_SAFETY_CAP {
                    // Safepoint: cooperate with the soft abort only.
                    self.timeout.refresh();
                    if self.timeout.is_soft_aborted() {
                        break;
                    }
                    thread::sleep(*step);
                }
                Ok(())
            }
            StubWork::SpinUntilReleased { step } => {
                let started = Instant::now();
                while !self.released.load(Ordering::Acquire)
                    && started.elapsed() < SPIN_SAFETY_CAP
                {
                    thread::sleep(*step);
                }
                Ok(())
            }
            StubWork::Fail(message) => Err(message.clone().into()),
            StubWork::Panic(message) => panic!("{message}"),
        }
    }

    fn after_work(&self) -> bool {
        if self.yielded.swap(false, Ordering::AcqRel) {
            // Slice yielded mid-event: bank the cumulative clock and keep
            // the event queued.
            self.timeout.pause_timer();
            return true;
        }

        self.timeout.stop_timer();
        self.completions.fetch_add(1, Ordering::AcqRel);
        let remaining = self
            .events
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |events| {
                Some(events.saturating_sub(1))
            })
            .expect("events update cannot fail")
            .saturating_sub(1);
        remaining > 0
    }

    fn abort(&self) {
        self.aborts.fetch_add(1, Ordering::AcqRel);
    }

    fn fast_fail(&self) {
        self.fast_fails.fetch_add(1, Ordering::AcqRel);
    }

    fn print_state(&self, out: &mut String) {
        let _ = writeln!(
            out,
            "stub computer #{}: runs={} completions={} aborts={} fast_fails={}",
            self.id,
            self.runs(),
            self.completions(),
            self.aborts(),
            self.fast_fails(),
        );
    }

    fn id(&self) -> u64 {
        self.id
    }

    fn timeout(&self) -> &TimeoutState {
        &self.timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn after_work_requeues_until_events_exhausted() {
        let scheduler = Scheduler::new(1);
        let stub = StubExecutor::with_events(&scheduler, 1, StubWork::Noop, 3);

        assert!(stub.after_work());
        assert!(stub.after_work());
        assert!(!stub.after_work());
        assert_eq!(stub.completions(), 3);

        // Draining an already-exhausted stub stays at zero, without underflow.
        assert!(!stub.after_work());
    }

    #[test]
    fn failing_work_returns_error() {
        let scheduler = Scheduler::new(1);
        let stub = StubExecutor::new(&scheduler, 1, StubWork::Fail("bad bytecode".to_string()));
        let err = stub.work().unwrap_err();
        assert_eq!(err.to_string(), "bad bytecode");
        assert_eq!(stub.runs(), 1);
    }

    #[test]
    fn released_spinner_returns() {
        let scheduler = Scheduler::new(1);
        let stub = StubExecutor::new(
            &scheduler,
            1,
            StubWork::SpinUntilReleased {
                step: Duration::from_millis(1),
            },
        );
        stub.release();
        stub.work().unwrap();
    }
}
