//! Properties of admission and the slice-budget formula.
//!
//! These run against schedulers that are never started: with no worker or
//! monitor threads, every admission is deterministic, so the properties can
//! assert exact arithmetic instead of timing-tolerant bounds.

use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;

use vmsched_rs::{Executor, ExecutorHandle, Scheduler, StubExecutor, StubWork};

/// Expected `scaled_period` for `queued` computers on `threads` workers,
/// straight from the definition.
fn expected_period(threads: u16, queued: usize) -> i64 {
    const MS: i64 = 1_000_000;
    let factor = i64::from(16 - threads.leading_zeros() as u16);
    let latency = 50 * MS * factor;
    let min_period = 5 * MS * factor;
    let count = 1 + queued as i64;
    if count < 10 {
        latency / count
    } else {
        min_period
    }
}

fn admit(scheduler: &Scheduler, id: u64) -> Arc<ExecutorHandle> {
    let handle = ExecutorHandle::new(
        Arc::new(StubExecutor::new(scheduler, id, StubWork::Noop)) as Arc<dyn Executor>,
    );
    scheduler.queue(&handle);
    handle
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// scaled_period == latency/(k+1) until ten tasks compete, then the
    /// scaled minimum period, for any worker count.
    #[test]
    fn scaled_period_matches_formula(threads in 1u16..=16, queued in 0usize..=15) {
        let scheduler = Scheduler::new(threads);
        for id in 0..queued {
            admit(&scheduler, id as u64);
        }
        prop_assert_eq!(scheduler.scaled_period(), expected_period(threads, queued));
    }

    /// Admission invariants across a burst of fresh computers: the queued
    /// flag tracks membership, assigned runtimes sit above the floor, and
    /// the floor itself never decreases.
    #[test]
    fn admission_burst_respects_floor_and_flags(count in 1usize..=20) {
        let scheduler = Scheduler::new(1);
        let mut floor = scheduler.minimum_virtual_runtime();
        let mut handles = Vec::new();

        for id in 0..count {
            let handle = admit(&scheduler, id as u64);
            prop_assert!(handle.on_queue());

            let new_floor = scheduler.minimum_virtual_runtime();
            prop_assert!(new_floor >= floor);
            floor = new_floor;

            // Fresh computers land a full scaled period above the floor
            // seen at their admission, so they can never undercut it.
            prop_assert!(handle.virtual_runtime() > floor);
            handles.push(handle);
        }

        prop_assert!(scheduler.has_pending_work());

        // Discarding the queue resets every flag so re-admission works.
        scheduler.stop();
        prop_assert!(!scheduler.has_pending_work());
        for handle in &handles {
            prop_assert!(!handle.on_queue());
        }
        scheduler.queue(&handles[0]);
        prop_assert!(handles[0].on_queue());
        prop_assert!(scheduler.has_pending_work());
    }

    /// Re-admitted computers never move backwards in virtual time.
    #[test]
    fn readmission_is_monotone(rounds in 1usize..=6) {
        let scheduler = Scheduler::new(2);
        let handle = admit(&scheduler, 0);
        let mut previous = handle.virtual_runtime();

        for id in 0..rounds {
            // Grow the floor with fresh neighbours, then cycle the handle
            // through the queue again.
            admit(&scheduler, 1 + id as u64);
            scheduler.stop();
            scheduler.queue(&handle);
            let assigned = handle.virtual_runtime();
            prop_assert!(assigned >= previous);
            previous = assigned;
        }
    }
}

#[test]
fn start_stop_cycles_are_idempotent_and_clean() {
    let scheduler = Scheduler::new(2);
    for _ in 0..3 {
        scheduler.start();
        scheduler.start();
        let handle = admit(&scheduler, 9);
        let stub = Arc::new(StubExecutor::new(
            &scheduler,
            10,
            StubWork::Sleep(Duration::from_millis(1)),
        ));
        let other = ExecutorHandle::new(Arc::clone(&stub) as Arc<dyn Executor>);
        scheduler.queue(&other);

        scheduler.stop();
        scheduler.stop();
        assert!(!scheduler.has_pending_work());
        assert!(!handle.on_queue());
        assert!(!other.on_queue());
        assert_eq!(handle.executing_worker(), None);
    }
}
