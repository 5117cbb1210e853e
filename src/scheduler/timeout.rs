//! Timeout State
//!
//! Per-executor timers and abort flags. Each computer owns one
//! [`TimeoutState`]; the scheduler resets it at the start of every slice and
//! the monitor advances it, raising flags as the computer's *cumulative*
//! execution time for the current event crosses the limits.
//!
//! # Flags
//!
//! | Flag | Raised when | Consumed by |
//! |------|-------------|-------------|
//! | `paused` | The slice deadline passed and other computers are waiting | VM safepoints: yield the slice, keep the event |
//! | `soft_abort` | Cumulative time ≥ [`TimeoutState::TIMEOUT`] | VM safepoints: terminate the event cooperatively |
//! | `hard_abort` | Monitor gave up on cooperation | VM abort machinery |
//!
//! Flag reads are lock-free so guest safepoints can poll them on hot paths.
//!
//! # Cumulative time
//!
//! The cumulative clock measures time spent on the *current event*, across
//! pauses: [`pause_timer`](TimeoutState::pause_timer) banks the elapsed time
//! and the next [`start_timer`](TimeoutState::start_timer) resumes from it,
//! so a computer that keeps getting paused still soft-aborts once the event
//! has consumed [`TimeoutState::TIMEOUT`] in total.
//! [`stop_timer`](TimeoutState::stop_timer) ends the event and clears
//! everything.
//!
//! All comparisons are on signed differences of monotonic nanos, so they
//! stay correct if the raw readings are large.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, Weak};

use super::clock::monotonic_nanos;
use super::core::{Scheduler, Shared};

/// Timer block, guarded by a private mutex. Flag state lives outside so
/// safepoint polls never contend with timer updates.
struct Timer {
    /// When the cumulative clock would have started had the whole event run
    /// in one go.
    cumulative_start: i64,
    /// Time banked by pauses, folded back in by the next `start_timer`.
    cumulative_elapsed: i64,
    /// When the current slice began.
    current_start: i64,
    /// When the current slice should end.
    current_deadline: i64,
}

/// Pause / soft-abort / hard-abort state for one executor.
pub struct TimeoutState {
    scheduler: Weak<Shared>,
    /// Cumulative budget before a soft abort is requested, in nanoseconds.
    timeout: i64,
    /// Grace window granted after each escalation step, in nanoseconds.
    abort_timeout: i64,
    paused: AtomicBool,
    soft_abort: AtomicBool,
    hard_abort: AtomicBool,
    timer: Mutex<Timer>,
}

impl TimeoutState {
    /// Cumulative time an event may consume before the soft-abort flag is
    /// raised: 7 seconds, in nanoseconds.
    pub const TIMEOUT: i64 = 7_000_000_000;

    /// Grace window between escalation steps (soft abort → hard abort →
    /// interrupt → replacement): 1.5 seconds, in nanoseconds.
    pub const ABORT_TIMEOUT: i64 = 1_500_000_000;

    /// Timeout state with the standard limits, bound to `scheduler` for
    /// slice-budget scaling and pause decisions.
    pub fn new(scheduler: &Scheduler) -> Self {
        Self::with_limits(scheduler, Self::TIMEOUT, Self::ABORT_TIMEOUT)
    }

    /// Timeout state with custom limits (nanoseconds). Production computers
    /// use [`TimeoutState::new`]; shortened limits exist so the escalation
    /// staircase can be exercised in test time.
    pub fn with_limits(scheduler: &Scheduler, timeout: i64, abort_timeout: i64) -> Self {
        assert!(timeout > 0, "timeout must be > 0");
        assert!(abort_timeout > 0, "abort_timeout must be > 0");
        let now = monotonic_nanos();
        Self {
            scheduler: scheduler.shared_weak(),
            timeout,
            abort_timeout,
            paused: AtomicBool::new(false),
            soft_abort: AtomicBool::new(false),
            hard_abort: AtomicBool::new(false),
            timer: Mutex::new(Timer {
                cumulative_start: now,
                cumulative_elapsed: 0,
                current_start: now,
                current_deadline: now,
            }),
        }
    }

    /// The cumulative soft-abort budget for this instance, in nanoseconds.
    #[inline]
    pub fn timeout_limit(&self) -> i64 {
        self.timeout
    }

    /// The escalation grace window for this instance, in nanoseconds.
    #[inline]
    pub fn abort_limit(&self) -> i64 {
        self.abort_timeout
    }

    /// Re-evaluate the pause and soft-abort flags against the clock.
    ///
    /// Called by the monitor on every inspection and by well-behaved guests
    /// at safepoints. The pause flag rises only once the slice deadline has
    /// passed *and* other computers are waiting; with an empty queue the
    /// slice may keep running.
    pub fn refresh(&self) {
        let now = monotonic_nanos();
        let (cumulative_start, current_deadline) = {
            let timer = self.timer.lock().expect("timeout timer poisoned");
            (timer.cumulative_start, timer.current_deadline)
        };

        if !self.soft_abort.load(Ordering::Acquire) && now - cumulative_start - self.timeout >= 0 {
            self.soft_abort.store(true, Ordering::Release);
        }

        if !self.paused.load(Ordering::Acquire) && current_deadline - now <= 0 {
            // Taken without the timer lock held: has_pending_work acquires
            // the scheduler mutex.
            if let Some(shared) = self.scheduler.upgrade() {
                if shared.has_pending_work() {
                    self.paused.store(true, Ordering::Release);
                }
            }
        }
    }

    /// Cumulative nanoseconds the current event has been executing.
    pub fn nano_cumulative(&self) -> i64 {
        let timer = self.timer.lock().expect("timeout timer poisoned");
        monotonic_nanos() - timer.cumulative_start
    }

    /// Nanoseconds the current slice has been executing.
    pub fn nano_current(&self) -> i64 {
        let timer = self.timer.lock().expect("timeout timer poisoned");
        monotonic_nanos() - timer.current_start
    }

    /// Whether the executor should yield its slice at the next safepoint.
    #[inline]
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Whether the executor should terminate the current event at the next
    /// safepoint.
    #[inline]
    pub fn is_soft_aborted(&self) -> bool {
        self.soft_abort.load(Ordering::Acquire)
    }

    /// Whether the monitor has given up on cooperative termination.
    #[inline]
    pub fn is_hard_aborted(&self) -> bool {
        self.hard_abort.load(Ordering::Acquire)
    }

    /// Raise the hard-abort flag (implies soft abort). Returns true if this
    /// call raised it.
    pub fn hard_abort(&self) -> bool {
        self.soft_abort.store(true, Ordering::Release);
        !self.hard_abort.swap(true, Ordering::AcqRel)
    }

    /// Begin a slice: stamp the slice clock, derive the deadline from the
    /// scheduler's current slice budget, and resume the cumulative clock
    /// from any banked time.
    pub(crate) fn start_timer(&self) {
        // Resolved before the timer lock: scaled_period takes the scheduler
        // mutex.
        let period = self
            .scheduler
            .upgrade()
            .map_or(0, |shared| shared.scaled_period());
        let now = monotonic_nanos();
        let mut timer = self.timer.lock().expect("timeout timer poisoned");
        timer.current_start = now;
        timer.current_deadline = now + period;
        timer.cumulative_start = now - timer.cumulative_elapsed;
    }

    /// Yield mid-event: bank the cumulative time and clear the pause flag.
    /// The event's soft-abort clock keeps running across the pause.
    pub fn pause_timer(&self) {
        let now = monotonic_nanos();
        {
            let mut timer = self.timer.lock().expect("timeout timer poisoned");
            timer.cumulative_elapsed = now - timer.cumulative_start;
        }
        self.paused.store(false, Ordering::Release);
    }

    /// End the event: zero the banked time and clear every flag.
    pub fn stop_timer(&self) {
        {
            let mut timer = self.timer.lock().expect("timeout timer poisoned");
            timer.cumulative_elapsed = 0;
        }
        self.paused.store(false, Ordering::Release);
        self.soft_abort.store(false, Ordering::Release);
        self.hard_abort.store(false, Ordering::Release);
    }
}

impl std::fmt::Debug for TimeoutState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeoutState")
            .field("paused", &self.is_paused())
            .field("soft_abort", &self.is_soft_aborted())
            .field("hard_abort", &self.is_hard_aborted())
            .finish()
    }
}
