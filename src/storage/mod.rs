//! Persisted scan task records
//!
//! The record is written by the task's owning routine only: once before
//! dispatch, at a pause checkpoint, and when the task ends.

pub mod file;
pub mod memory;

use crate::status::TaskIndex;
use crate::{ScanError, ScanResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub use file::FileTaskStore;
pub use memory::MemoryTaskStore;

/// Lifecycle status of a persisted task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Executing,
    Paused,
    Done,
    Error,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Executing => "executing",
            TaskStatus::Paused => "paused",
            TaskStatus::Done => "done",
            TaskStatus::Error => "error",
        }
    }

    pub(crate) fn as_u8(self) -> u8 {
        match self {
            TaskStatus::Executing => 0,
            TaskStatus::Paused => 1,
            TaskStatus::Done => 2,
            TaskStatus::Error => 3,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => TaskStatus::Paused,
            2 => TaskStatus::Done,
            3 => TaskStatus::Error,
            _ => TaskStatus::Executing,
        }
    }

    /// Executing -> {Paused, Done, Error}, Paused -> Executing
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (TaskStatus::Executing, TaskStatus::Paused)
                | (TaskStatus::Executing, TaskStatus::Done)
                | (TaskStatus::Executing, TaskStatus::Error)
                | (TaskStatus::Paused, TaskStatus::Executing)
        )
    }

}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted scan task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanTaskRecord {
    pub task_id: String,
    pub status: TaskStatus,
    /// JSON list of target snapshots
    pub targets: String,
    /// JSON list of plugin names, order preserving
    pub plugins: String,
    /// JSON of the original scan request
    pub scan_config: String,
    /// Comma separated task indexes in flight at the last checkpoint
    #[serde(default)]
    pub survival_task_indexes: String,
    /// Highest task index admitted when the last checkpoint fired
    #[serde(default)]
    pub dispatch_cursor: TaskIndex,
    /// Targets that failed the reachability probe before the last checkpoint
    #[serde(default)]
    pub unreachable_targets: Vec<String>,
    #[serde(default)]
    pub reason: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScanTaskRecord {
    pub fn new(
        task_id: impl Into<String>,
        targets: String,
        plugins: String,
        scan_config: String,
    ) -> Self {
        let now = Utc::now();
        Self {
            task_id: task_id.into(),
            status: TaskStatus::Executing,
            targets,
            plugins,
            scan_config,
            survival_task_indexes: String::new(),
            dispatch_cursor: 0,
            unreachable_targets: Vec::new(),
            reason: String::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to `next`, rejecting transitions the lifecycle forbids
    pub fn transition(&mut self, next: TaskStatus) -> ScanResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(ScanError::InvalidTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Terminal failure with a captured reason
    pub fn fail(&mut self, reason: impl Into<String>) -> ScanResult<()> {
        self.transition(TaskStatus::Error)?;
        self.reason = reason.into();
        Ok(())
    }

    pub fn set_checkpoint(&mut self, survivors: &[TaskIndex], cursor: TaskIndex, unreachable: &[String]) {
        self.survival_task_indexes = encode_indexes(survivors);
        self.dispatch_cursor = cursor;
        self.unreachable_targets = unreachable.to_vec();
        self.updated_at = Utc::now();
    }

    pub fn survival_indexes(&self) -> ScanResult<Vec<TaskIndex>> {
        decode_indexes(&self.survival_task_indexes)
    }
}

pub fn encode_indexes(indexes: &[TaskIndex]) -> String {
    indexes
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

pub fn decode_indexes(raw: &str) -> ScanResult<Vec<TaskIndex>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<TaskIndex>().map_err(ScanError::from))
        .collect()
}

/// Task record persistence
pub trait TaskStore: Send + Sync {
    fn save(&self, record: &ScanTaskRecord) -> ScanResult<()>;

    /// Fails with [`ScanError::TaskNotFound`] for unknown ids
    fn load(&self, task_id: &str) -> ScanResult<ScanTaskRecord>;

    /// Newest first
    fn list(&self) -> ScanResult<Vec<ScanTaskRecord>>;

    fn delete(&self, task_id: &str) -> ScanResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_transitions() {
        use TaskStatus::*;
        assert!(Executing.can_transition_to(Paused));
        assert!(Executing.can_transition_to(Done));
        assert!(Executing.can_transition_to(Error));
        assert!(Paused.can_transition_to(Executing));
        assert!(!Paused.can_transition_to(Done));
        assert!(!Done.can_transition_to(Executing));
        assert!(!Error.can_transition_to(Executing));
        assert!(!Executing.can_transition_to(Executing));
    }

    #[test]
    fn test_record_rejects_leaving_done() {
        let mut record = ScanTaskRecord::new("t", "[]".into(), "[]".into(), "{}".into());
        record.transition(TaskStatus::Done).unwrap();
        let err = record.transition(TaskStatus::Executing).unwrap_err();
        assert!(matches!(err, ScanError::InvalidTransition { .. }));
        assert_eq!(record.status, TaskStatus::Done);
    }

    #[test]
    fn test_fail_sets_reason() {
        let mut record = ScanTaskRecord::new("t", "[]".into(), "[]".into(), "{}".into());
        record.fail("probe exploded").unwrap();
        assert_eq!(record.status, TaskStatus::Error);
        assert_eq!(record.reason, "probe exploded");
    }

    #[test]
    fn test_old_records_load_without_unreachable_list() {
        let record = ScanTaskRecord::new("t", "[]".into(), "[]".into(), "{}".into());
        let mut value = serde_json::to_value(&record).unwrap();
        value.as_object_mut().unwrap().remove("unreachable_targets");
        let loaded: ScanTaskRecord = serde_json::from_value(value).unwrap();
        assert!(loaded.unreachable_targets.is_empty());
    }

    #[test]
    fn test_index_codec() {
        assert_eq!(encode_indexes(&[3, 7, 12]), "3,7,12");
        assert_eq!(decode_indexes("3, 7,12").unwrap(), vec![3, 7, 12]);
        assert!(decode_indexes("").unwrap().is_empty());
        assert!(decode_indexes("1,x").is_err());

        let mut record = ScanTaskRecord::new("t", "[]".into(), "[]".into(), "{}".into());
        record.set_checkpoint(&[4, 5], 6, &["http://down.test/".to_string()]);
        assert_eq!(record.survival_indexes().unwrap(), vec![4, 5]);
        assert_eq!(record.dispatch_cursor, 6);
        assert_eq!(record.unreachable_targets, vec!["http://down.test/"]);
    }
}
