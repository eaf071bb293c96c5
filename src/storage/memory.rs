use super::{ScanTaskRecord, TaskStore};
use crate::{ScanError, ScanResult};
use std::collections::HashMap;
use std::sync::Mutex;

/// Process-local task store
#[derive(Debug, Default)]
pub struct MemoryTaskStore {
    records: Mutex<HashMap<String, ScanTaskRecord>>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> std::sync::MutexGuard<'_, HashMap<String, ScanTaskRecord>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl TaskStore for MemoryTaskStore {
    fn save(&self, record: &ScanTaskRecord) -> ScanResult<()> {
        self.records()
            .insert(record.task_id.clone(), record.clone());
        Ok(())
    }

    fn load(&self, task_id: &str) -> ScanResult<ScanTaskRecord> {
        self.records()
            .get(task_id)
            .cloned()
            .ok_or_else(|| ScanError::TaskNotFound(task_id.to_string()))
    }

    fn list(&self) -> ScanResult<Vec<ScanTaskRecord>> {
        let mut records: Vec<_> = self.records().values().cloned().collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }

    fn delete(&self, task_id: &str) -> ScanResult<()> {
        self.records()
            .remove(task_id)
            .map(|_| ())
            .ok_or_else(|| ScanError::TaskNotFound(task_id.to_string()))
    }
}
