//! Run Queue
//!
//! Ordered multiset of runnable executors, keyed by virtual runtime with the
//! handle's admission sequence as a stable tiebreak. Workers always pop the
//! minimum key, so the computer that has consumed the least fair-share time
//! runs next.
//!
//! # Keying
//!
//! Keys are snapshots: an entry captures the executor's `virtual_runtime` at
//! insert time. Queued executors are never re-keyed: virtual-time
//! accounting only advances *bound* executors (and the one currently
//! yielding), so a snapshot stays accurate for as long as the entry is
//! queued. This is what lets a plain ordered set satisfy the contract
//! without arbitrary removal.
//!
//! # Correctness Invariants
//!
//! - **Flag agreement**: `on_queue` is true exactly while the executor has
//!   an entry here. All three transitions (`insert`, `pop_min`, `clear`)
//!   happen in this module, under the scheduler mutex.
//! - **Single instance**: an executor appears at most once. `insert` rejects
//!   handles already marked queued.
//! - **Total order**: the `(virtual_runtime, seq)` key is unique per entry
//!   because `seq` is unique per handle, so distinct executors never compare
//!   equal.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::sync::Arc;

use super::executor::ExecutorHandle;

/// One queued executor, ordered by `(runtime, seq)`.
struct Entry {
    /// Virtual runtime snapshot taken at insert.
    runtime: i64,
    /// Handle tiebreak, unique per executor.
    seq: u64,
    executor: Arc<ExecutorHandle>,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.runtime == other.runtime && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.runtime
            .cmp(&other.runtime)
            .then(self.seq.cmp(&other.seq))
    }
}

/// Ordered multiset of runnable executors keyed by virtual runtime.
///
/// All operations require the scheduler mutex; the structure itself is not
/// synchronized.
#[derive(Default)]
pub struct RunQueue {
    entries: BTreeSet<Entry>,
}

impl RunQueue {
    pub fn new() -> Self {
        Self {
            entries: BTreeSet::new(),
        }
    }

    /// Number of queued executors.
    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Smallest queued virtual runtime, if any. Seeds the floor computation
    /// in virtual-time accounting.
    pub fn min_runtime(&self) -> Option<i64> {
        self.entries.first().map(|entry| entry.runtime)
    }

    /// Insert an executor, marking it queued.
    ///
    /// The caller must have verified the admission precondition; a handle
    /// already marked queued indicates a broken caller.
    pub fn insert(&mut self, executor: Arc<ExecutorHandle>) {
        debug_assert!(!executor.on_queue(), "executor inserted twice");
        executor.set_on_queue(true);
        let inserted = self.entries.insert(Entry {
            runtime: executor.virtual_runtime(),
            seq: executor.seq(),
            executor,
        });
        debug_assert!(inserted, "duplicate run-queue key");
    }

    /// Pop the executor with the least virtual runtime, clearing its queued
    /// flag.
    pub fn pop_min(&mut self) -> Option<Arc<ExecutorHandle>> {
        let entry = self.entries.pop_first()?;
        entry.executor.set_on_queue(false);
        Some(entry.executor)
    }

    /// Drop every entry, clearing each executor's queued flag so it can be
    /// admitted again after a restart.
    pub fn clear(&mut self) {
        for entry in &self.entries {
            entry.executor.set_on_queue(false);
        }
        self.entries.clear();
    }
}

impl std::fmt::Debug for RunQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunQueue").field("len", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::super::core::Scheduler;
    use super::super::executor_stub::{StubExecutor, StubWork};
    use super::*;

    fn handle(scheduler: &Scheduler, id: u64, runtime: i64) -> Arc<ExecutorHandle> {
        let h = ExecutorHandle::new(Arc::new(StubExecutor::new(scheduler, id, StubWork::Noop)));
        h.set_virtual_runtime(runtime);
        h
    }

    #[test]
    fn pops_in_runtime_order() {
        let scheduler = Scheduler::new(1);
        let mut queue = RunQueue::new();
        queue.insert(handle(&scheduler, 0, 300));
        queue.insert(handle(&scheduler, 1, 100));
        queue.insert(handle(&scheduler, 2, 200));

        assert_eq!(queue.min_runtime(), Some(100));
        assert_eq!(queue.pop_min().unwrap().id(), 1);
        assert_eq!(queue.pop_min().unwrap().id(), 2);
        assert_eq!(queue.pop_min().unwrap().id(), 0);
        assert!(queue.pop_min().is_none());
    }

    #[test]
    fn equal_runtimes_pop_in_admission_order() {
        let scheduler = Scheduler::new(1);
        let mut queue = RunQueue::new();
        // Handles are created in id order, so seq order matches id order.
        let a = handle(&scheduler, 10, 500);
        let b = handle(&scheduler, 11, 500);
        let c = handle(&scheduler, 12, 500);
        queue.insert(Arc::clone(&b));
        queue.insert(Arc::clone(&c));
        queue.insert(Arc::clone(&a));

        assert_eq!(queue.pop_min().unwrap().id(), 10);
        assert_eq!(queue.pop_min().unwrap().id(), 11);
        assert_eq!(queue.pop_min().unwrap().id(), 12);
    }

    #[test]
    fn flag_tracks_membership() {
        let scheduler = Scheduler::new(1);
        let mut queue = RunQueue::new();
        let h = handle(&scheduler, 0, 42);
        assert!(!h.on_queue());

        queue.insert(Arc::clone(&h));
        assert!(h.on_queue());

        let popped = queue.pop_min().unwrap();
        assert!(Arc::ptr_eq(&popped, &h));
        assert!(!h.on_queue());
    }

    #[test]
    fn clear_resets_flags() {
        let scheduler = Scheduler::new(1);
        let mut queue = RunQueue::new();
        let a = handle(&scheduler, 0, 1);
        let b = handle(&scheduler, 1, 2);
        queue.insert(Arc::clone(&a));
        queue.insert(Arc::clone(&b));

        queue.clear();
        assert!(queue.is_empty());
        assert!(!a.on_queue());
        assert!(!b.on_queue());
    }
}
