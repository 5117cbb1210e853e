//! # Metrics Module
//!
//! Cheap, always-on counters for scheduler observability.
//!
//! ## Design
//!
//! - **Shared atomics**: workers are long-lived and individually replaceable,
//!   so there is no join point at which per-worker locals could be merged;
//!   every counter is a relaxed atomic instead.
//! - **Cache-line isolation**: each counter sits in its own
//!   [`CachePadded`] slot so workers bumping different counters never share
//!   a line.
//! - **Snapshot export**: [`MetricsSnapshot`] is a plain serializable struct
//!   for logs, dashboards, and test assertions.
//!
//! Counts are monotone over the scheduler's lifetime; `stop`/`start` cycles
//! do not reset them.

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_utils::CachePadded;
use serde::Serialize;

/// Live scheduler counters. One instance per scheduler.
#[derive(Default)]
pub struct SchedulerMetrics {
    /// Completed `work()` invocations (including failed ones).
    slices_executed: CachePadded<AtomicU64>,
    /// Slices that returned an error or panicked.
    work_errors: CachePadded<AtomicU64>,
    /// Bind attempts refused because the executor was already bound
    /// elsewhere. Any non-zero value indicates a serious bug.
    binds_refused: CachePadded<AtomicU64>,
    /// Timeout reports emitted (post-debounce).
    timeout_reports: CachePadded<AtomicU64>,
    /// Executors transitioned to hard abort by the monitor.
    hard_aborts: CachePadded<AtomicU64>,
    /// Worker threads replaced (crash recovery or abandonment).
    workers_replaced: CachePadded<AtomicU64>,
}

impl SchedulerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub(crate) fn record_slice(&self) {
        self.slices_executed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_work_error(&self) {
        self.work_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_bind_refused(&self) {
        self.binds_refused.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_timeout_report(&self) {
        self.timeout_reports.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_hard_abort(&self) {
        self.hard_aborts.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_worker_replaced(&self) {
        self.workers_replaced.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy the counters into a plain snapshot.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            slices_executed: self.slices_executed.load(Ordering::Relaxed),
            work_errors: self.work_errors.load(Ordering::Relaxed),
            binds_refused: self.binds_refused.load(Ordering::Relaxed),
            timeout_reports: self.timeout_reports.load(Ordering::Relaxed),
            hard_aborts: self.hard_aborts.load(Ordering::Relaxed),
            workers_replaced: self.workers_replaced.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`SchedulerMetrics`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub slices_executed: u64,
    pub work_errors: u64,
    pub binds_refused: u64,
    pub timeout_reports: u64,
    pub hard_aborts: u64,
    pub workers_replaced: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_recordings() {
        let metrics = SchedulerMetrics::new();
        metrics.record_slice();
        metrics.record_slice();
        metrics.record_work_error();
        metrics.record_worker_replaced();

        let snap = metrics.snapshot();
        assert_eq!(snap.slices_executed, 2);
        assert_eq!(snap.work_errors, 1);
        assert_eq!(snap.binds_refused, 0);
        assert_eq!(snap.workers_replaced, 1);
    }

    #[test]
    fn default_snapshot_is_zero() {
        assert_eq!(
            SchedulerMetrics::new().snapshot(),
            MetricsSnapshot::default()
        );
    }
}
