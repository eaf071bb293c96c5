//! Thread-safe progress accounting for a single scan task
//!
//! Counters are plain atomics and may be read at any time. The in-flight
//! index set is the only exact piece of state: it is what a checkpoint
//! persists as the survival set.

use crate::storage::TaskStatus;
use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicU8, Ordering};
use std::sync::Mutex;

/// Identity of one (target, plugin) admission.
///
/// Indexes follow target-major cross-product order starting at 1, so a pair
/// keeps the same index across pause and resume.
pub type TaskIndex = u64;

/// Counter snapshot rendered for the feedback stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub total_targets: i64,
    pub total_plugins: i64,
    pub total_tasks: i64,
    pub finished_targets: i64,
    pub finished_tasks: i64,
    pub active_tasks: i64,
    pub active_targets: i64,
    pub task_id: String,
    pub status: String,
}

impl StatusSnapshot {
    /// Fraction of finished tasks, 0.0 when nothing is scheduled
    pub fn progress(&self) -> f64 {
        if self.total_tasks <= 0 {
            return 0.0;
        }
        (self.finished_tasks as f64 / self.total_tasks as f64).min(1.0)
    }
}

pub struct StatusManager {
    task_id: String,
    phase: AtomicU8,
    target_total: AtomicI64,
    plugin_total: AtomicI64,
    target_finished: AtomicI64,
    task_finished: AtomicI64,
    active_task: AtomicI64,
    active_target: AtomicI64,
    last_index: AtomicU64,
    in_flight: Mutex<BTreeSet<TaskIndex>>,
}

impl StatusManager {
    pub fn new(task_id: impl Into<String>, target_total: usize, plugin_total: usize) -> Self {
        Self {
            task_id: task_id.into(),
            phase: AtomicU8::new(TaskStatus::Executing.as_u8()),
            target_total: AtomicI64::new(target_total as i64),
            plugin_total: AtomicI64::new(plugin_total as i64),
            target_finished: AtomicI64::new(0),
            task_finished: AtomicI64::new(0),
            active_task: AtomicI64::new(0),
            active_target: AtomicI64::new(0),
            last_index: AtomicU64::new(0),
            in_flight: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn plugin_total(&self) -> i64 {
        self.plugin_total.load(Ordering::SeqCst)
    }

    pub fn set_phase(&self, status: TaskStatus) {
        self.phase.store(status.as_u8(), Ordering::SeqCst);
    }

    pub fn phase(&self) -> TaskStatus {
        TaskStatus::from_u8(self.phase.load(Ordering::SeqCst))
    }

    pub fn do_active_target(&self) {
        self.active_target.fetch_add(1, Ordering::SeqCst);
    }

    /// Admit a task: assign the next index and record it as in flight
    pub fn do_active_task(&self) -> TaskIndex {
        let index = self.last_index.fetch_add(1, Ordering::SeqCst) + 1;
        self.lock_in_flight().insert(index);
        self.active_task.fetch_add(1, Ordering::SeqCst);
        index
    }

    /// Complete an admitted task. A second call for the same index is ignored.
    pub fn done_task(&self, index: TaskIndex) {
        if !self.lock_in_flight().remove(&index) {
            warn!("Task index {} completed twice or never admitted", index);
            return;
        }
        self.active_task.fetch_sub(1, Ordering::SeqCst);
        self.task_finished.fetch_add(1, Ordering::SeqCst);
    }

    pub fn done_target(&self) {
        self.active_target.fetch_sub(1, Ordering::SeqCst);
        self.target_finished.fetch_add(1, Ordering::SeqCst);
    }

    /// Release an active target that was interrupted before finishing
    pub fn abandon_target(&self) {
        self.active_target.fetch_sub(1, Ordering::SeqCst);
    }

    /// Short-circuit a whole active target: all of its pairs count as
    /// finished in one step and their indexes are reserved unused.
    pub fn done_failure_target(&self) {
        let plugins = self.plugin_total.load(Ordering::SeqCst);
        self.last_index.fetch_add(plugins.max(0) as u64, Ordering::SeqCst);
        self.task_finished.fetch_add(plugins, Ordering::SeqCst);
        self.done_target();
    }

    /// Count a pair finished in an earlier run without admitting it
    pub fn skip_task(&self) -> TaskIndex {
        let index = self.last_index.fetch_add(1, Ordering::SeqCst) + 1;
        self.task_finished.fetch_add(1, Ordering::SeqCst);
        index
    }

    /// Count a target whose pairs all finished in an earlier run
    pub fn skip_target(&self) {
        let plugins = self.plugin_total.load(Ordering::SeqCst);
        self.last_index.fetch_add(plugins.max(0) as u64, Ordering::SeqCst);
        self.task_finished.fetch_add(plugins, Ordering::SeqCst);
        self.target_finished.fetch_add(1, Ordering::SeqCst);
    }

    /// Highest index handed out so far
    pub fn last_index(&self) -> TaskIndex {
        self.last_index.load(Ordering::SeqCst)
    }

    /// Pure read of the counters
    pub fn get_status(&self) -> StatusSnapshot {
        let target_total = self.target_total.load(Ordering::SeqCst);
        let plugin_total = self.plugin_total.load(Ordering::SeqCst);
        StatusSnapshot {
            total_targets: target_total,
            total_plugins: plugin_total,
            total_tasks: target_total * plugin_total,
            finished_targets: self.target_finished.load(Ordering::SeqCst),
            finished_tasks: self.task_finished.load(Ordering::SeqCst),
            active_tasks: self.active_task.load(Ordering::SeqCst),
            active_targets: self.active_target.load(Ordering::SeqCst),
            task_id: self.task_id.clone(),
            status: self.phase().as_str().to_string(),
        }
    }

    /// Ascending snapshot of the in-flight set, taken at checkpoint time
    pub fn get_current_active_task_indexes(&self) -> Vec<TaskIndex> {
        self.lock_in_flight().iter().copied().collect()
    }

    fn lock_in_flight(&self) -> std::sync::MutexGuard<'_, BTreeSet<TaskIndex>> {
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;

    #[test]
    fn test_task_lifecycle_counters() {
        let status = StatusManager::new("t-1", 2, 3);
        status.do_active_target();
        let a = status.do_active_task();
        let b = status.do_active_task();
        assert_eq!((a, b), (1, 2));
        assert_eq!(status.get_current_active_task_indexes(), vec![1, 2]);

        status.done_task(a);
        status.done_task(a);
        let snapshot = status.get_status();
        assert_eq!(snapshot.active_tasks, 1);
        assert_eq!(snapshot.finished_tasks, 1);
        assert_eq!(snapshot.total_tasks, 6);
        assert_eq!(status.get_current_active_task_indexes(), vec![2]);
    }

    #[test]
    fn test_failure_target_short_circuits_plugin_set() {
        let status = StatusManager::new("t-2", 2, 4);
        status.do_active_target();
        status.done_failure_target();

        let snapshot = status.get_status();
        assert_eq!(snapshot.finished_tasks, 4);
        assert_eq!(snapshot.active_tasks, 0);
        assert_eq!(snapshot.finished_targets, 1);
        assert_eq!(snapshot.active_targets, 0);

        // the next target starts at ordinal 5
        status.do_active_target();
        assert_eq!(status.do_active_task(), 5);
    }

    #[test]
    fn test_skips_keep_indexes_aligned() {
        let status = StatusManager::new("t-3", 2, 2);
        status.skip_target();
        assert_eq!(status.skip_task(), 3);
        assert_eq!(status.do_active_task(), 4);
        assert_eq!(status.get_status().finished_tasks, 3);
    }

    #[test]
    fn test_get_status_is_idempotent() {
        let status = StatusManager::new("t-4", 5, 7);
        status.do_active_target();
        let idx = status.do_active_task();
        status.done_task(idx);
        status.set_phase(TaskStatus::Paused);

        let first = serde_json::to_vec(&status.get_status()).unwrap();
        let second = serde_json::to_vec(&status.get_status()).unwrap();
        assert_eq!(first, second);
        assert_eq!(status.get_status().status, "paused");
    }

    #[test]
    fn test_concurrent_mutators_settle() {
        let status = Arc::new(StatusManager::new("t-5", 8, 50));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let status = Arc::clone(&status);
                std::thread::spawn(move || {
                    status.do_active_target();
                    for _ in 0..50 {
                        let idx = status.do_active_task();
                        status.done_task(idx);
                    }
                    status.done_target();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let snapshot = status.get_status();
        assert_eq!(snapshot.finished_tasks, snapshot.total_tasks);
        assert_eq!(snapshot.active_tasks, 0);
        assert_eq!(snapshot.finished_targets, 8);
        assert!(status.get_current_active_task_indexes().is_empty());
    }

    proptest! {
        #[test]
        fn prop_counters_stay_bounded(ops in proptest::collection::vec(0u8..3, 0..60)) {
            let targets = 4usize;
            let plugins = 3usize;
            let status = StatusManager::new("prop", targets, plugins);
            let mut open: Vec<TaskIndex> = Vec::new();
            let mut started_targets = 0usize;

            for op in ops {
                match op {
                    0 if open.len() + (status.get_status().finished_tasks as usize) < targets * plugins => {
                        open.push(status.do_active_task());
                    }
                    1 => {
                        if let Some(idx) = open.pop() {
                            status.done_task(idx);
                        }
                    }
                    2 if started_targets < targets
                        && (status.last_index() as usize) + plugins <= targets * plugins =>
                    {
                        started_targets += 1;
                        status.do_active_target();
                        status.done_failure_target();
                    }
                    _ => {}
                }
                let snapshot = status.get_status();
                prop_assert!(snapshot.active_tasks >= 0);
                prop_assert!(snapshot.finished_tasks <= snapshot.total_tasks);
                prop_assert_eq!(snapshot.active_tasks as usize, status.get_current_active_task_indexes().len());
            }
        }
    }
}
