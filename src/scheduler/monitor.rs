//! Monitor
//!
//! A single thread that observes every runner and terminates slices that
//! have overrun their budget. Cooperation is always tried first; force is
//! applied one rung at a time.
//!
//! # Escalation staircase
//!
//! With `t` the executor's cumulative time and `over = t − TIMEOUT −
//! ABORT_TIMEOUT`:
//!
//! ```text
//!   t < TIMEOUT                     normal execution (refresh may pause)
//!   t ≥ TIMEOUT                     soft abort: flag polled at VM safepoints
//!   over ≥ 0                        hard abort: flag + abort() call
//!   over ≥ ABORT_TIMEOUT            timeout report + worker interrupt
//!   over ≥ 2 × ABORT_TIMEOUT        worker abandoned and replaced; the
//!                                   executor is drained via after_work
//! ```
//!
//! The last rung bounds the damage a runaway computer can do to
//! `2 × ABORT_TIMEOUT` of one worker's time before the pool recovers.
//!
//! # Cadence
//!
//! While the pool is busy (queued work exceeds idle workers) a pause may be
//! due imminently, so the monitor sleeps one scaled period at a time. Idle,
//! it only needs to advance soft/hard abort flags, and sleeps the longer
//! monitor interval. Admissions that flip the pool into the busy state kick
//! `monitor_wakeup` so the cadence tightens immediately.
//!
//! # Locking
//!
//! `check_runners` snapshots the live runners under the thread-table mutex,
//! then escalates with no table lock held: `after_work` (on the drain path)
//! takes the scheduler mutex, and holding the table lock across it would
//! invert the crate's lock order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use tracing::{error, warn};

use super::core::{MonitorSlot, Shared};
use super::worker::{spawn_runner, TaskRunner};

/// Spawn the monitor thread. Called under the thread-table mutex.
pub(crate) fn spawn_monitor(shared: &Arc<Shared>) -> MonitorSlot {
    let interrupt = Arc::new(AtomicBool::new(false));
    let thread = thread::Builder::new()
        .name("Computer-Monitor".to_string())
        .spawn({
            let shared = Arc::clone(shared);
            let interrupt = Arc::clone(&interrupt);
            move || run_monitor(&shared, &interrupt)
        })
        .expect("failed to spawn monitor thread");
    MonitorSlot { interrupt, thread }
}

/// The monitor thread body.
pub(crate) fn run_monitor(shared: &Arc<Shared>, interrupt: &AtomicBool) {
    loop {
        {
            let state = shared.sched.lock().expect("scheduler mutex poisoned");
            let wait = shared.monitor_wait_locked(&state);
            // A spurious wake is fine: the next iteration just re-inspects.
            let _ = shared
                .monitor_wakeup
                .wait_timeout(state, wait)
                .expect("scheduler mutex poisoned");
        }

        if interrupt.swap(false, Ordering::AcqRel) {
            if shared.running.load(Ordering::Acquire) {
                error!("monitor interrupted while scheduler is running; computers may behave very badly");
            }
            break;
        }
        if !shared.running.load(Ordering::Acquire) {
            break;
        }

        check_runners(shared);
    }
}

/// Walk the worker slots: replace dead workers, then escalate overrunning
/// slices.
fn check_runners(shared: &Arc<Shared>) {
    // Phase one, under the table lock: crash recovery and a snapshot of the
    // live runners.
    let live = {
        let mut table = shared.table.lock().expect("thread table poisoned");
        let mut live = Vec::with_capacity(table.runners.len());
        for index in 0..table.runners.len() {
            let dead = table.runners[index]
                .as_ref()
                .map_or(true, |slot| slot.thread.is_finished());
            if dead {
                if !shared.running.load(Ordering::Acquire) {
                    continue;
                }
                if let Some(old) = table.runners[index].take() {
                    warn!(
                        worker = %old.runner.name,
                        slot = index,
                        "previous runner has crashed, restarting"
                    );
                    old.runner.running.store(false, Ordering::Release);
                } else {
                    warn!(slot = index, "runner slot empty, starting replacement");
                }
                table.runners[index] = Some(spawn_runner(shared));
                shared.metrics.record_worker_replaced();
                // A fresh runner has nothing bound yet; skip escalation.
                continue;
            }
            let slot = table.runners[index].as_ref().expect("slot is live");
            live.push((index, Arc::clone(&slot.runner)));
        }
        live
    };

    // Phase two, no table lock held.
    for (index, runner) in live {
        escalate(shared, index, &runner);
    }
}

/// Apply the escalation staircase to one runner's bound executor.
fn escalate(shared: &Arc<Shared>, slot_index: usize, runner: &Arc<TaskRunner>) {
    // If the runner has no work, skip.
    let Some(executor) = runner.current_executor() else {
        return;
    };

    // Let the timeout state raise its own pause/soft-abort flags.
    let timeout = executor.executor().timeout();
    timeout.refresh();

    // Within normal execution plus the soft-abort grace window: let the
    // machine do its work.
    let elapsed = timeout.nano_cumulative();
    let over = elapsed - timeout.timeout_limit() - timeout.abort_limit();
    if over < 0 {
        return;
    }

    if timeout.hard_abort() {
        shared.metrics.record_hard_abort();
    }
    executor.executor().abort();

    if over < timeout.abort_limit() {
        return;
    }

    // Hard-aborted a full window ago and still running: dump state and
    // interrupt the worker.
    runner.report_timeout(shared, &executor, elapsed);
    shared.interrupt_worker(runner);

    if over < 2 * timeout.abort_limit() {
        return;
    }

    // Two windows past hard abort: give up on the thread. Drain its
    // executor so the computer is not leaked, then install a replacement.
    runner.running.store(false, Ordering::Release);
    shared.interrupt_worker(runner);

    if let Some(drained) = runner.take_current_if(&executor) {
        shared.after_work(runner, &drained);
    }

    let mut table = shared.table.lock().expect("thread table poisoned");
    if !shared.running.load(Ordering::Acquire) {
        return;
    }
    let still_installed = table.runners[slot_index]
        .as_ref()
        .is_some_and(|slot| Arc::ptr_eq(&slot.runner, runner));
    if still_installed {
        // Dropping the slot detaches the abandoned thread; it exits on its
        // own once work() returns and it observes its cleared running flag.
        table.runners[slot_index] = Some(spawn_runner(shared));
        shared.metrics.record_worker_replaced();
        warn!(
            worker = %runner.name,
            slot = slot_index,
            computer = executor.id(),
            "worker abandoned after ignoring hard abort; replacement started"
        );
    }
}
