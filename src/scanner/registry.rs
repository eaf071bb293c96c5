//! Registry of running task managers, keyed by task id

use crate::task::TaskManager;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// Shared handle; clones see the same registry
#[derive(Clone, Default)]
pub struct RunningTasks {
    inner: Arc<Mutex<HashMap<String, Arc<TaskManager>>>>,
}

/// Removes its task from the registry when dropped
pub struct Registration {
    registry: RunningTasks,
    task_id: String,
}

impl RunningTasks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<TaskManager>>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register `manager`; `None` when the id is already running
    pub fn register(&self, task_id: &str, manager: Arc<TaskManager>) -> Option<Registration> {
        let mut tasks = self.lock();
        if tasks.contains_key(task_id) {
            return None;
        }
        tasks.insert(task_id.to_string(), manager);
        Some(Registration {
            registry: self.clone(),
            task_id: task_id.to_string(),
        })
    }

    pub fn get(&self, task_id: &str) -> Option<Arc<TaskManager>> {
        self.lock().get(task_id).cloned()
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.lock().contains_key(task_id)
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.lock().remove(&self.task_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;

    #[test]
    fn test_registration_is_scoped() {
        let registry = RunningTasks::new();
        let manager = Arc::new(TaskManager::new(&CancellationToken::new()));

        let guard = registry.register("a", Arc::clone(&manager)).unwrap();
        assert!(registry.contains("a"));
        assert!(registry.register("a", Arc::clone(&manager)).is_none());
        assert_eq!(registry.ids(), vec!["a".to_string()]);

        drop(guard);
        assert!(registry.is_empty());
        assert!(registry.get("a").is_none());
    }
}
