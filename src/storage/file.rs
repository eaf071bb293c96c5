//! JSON file task store, one file per task id

use super::{ScanTaskRecord, TaskStore};
use crate::{ScanError, ScanResult};
use log::{debug, warn};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub struct FileTaskStore {
    dir: PathBuf,
}

impl FileTaskStore {
    /// Open (and create) a store rooted at `dir`
    pub fn new<P: AsRef<Path>>(dir: P) -> ScanResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|e| {
            ScanError::StorageError(format!("cannot create {}: {}", dir.display(), e))
        })?;
        Ok(Self { dir })
    }

    /// `~/.hybridscan/tasks`
    pub fn default_location() -> ScanResult<PathBuf> {
        let home = dirs::home_dir()
            .ok_or_else(|| ScanError::StorageError("home directory not found".to_string()))?;
        Ok(home.join(".hybridscan").join("tasks"))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, task_id: &str) -> ScanResult<PathBuf> {
        if task_id.is_empty()
            || !task_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(ScanError::StorageError(format!("invalid task id: {:?}", task_id)));
        }
        Ok(self.dir.join(format!("{}.json", task_id)))
    }
}

impl TaskStore for FileTaskStore {
    fn save(&self, record: &ScanTaskRecord) -> ScanResult<()> {
        let path = self.path_for(&record.task_id)?;
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(record)?;

        fs::write(&tmp, json.as_bytes())?;
        fs::rename(&tmp, &path)?;
        debug!("Saved task {} ({})", record.task_id, record.status);
        Ok(())
    }

    fn load(&self, task_id: &str) -> ScanResult<ScanTaskRecord> {
        let path = self.path_for(task_id)?;
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(ScanError::TaskNotFound(task_id.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_str(&content)?)
    }

    fn list(&self) -> ScanResult<Vec<ScanTaskRecord>> {
        let mut records = Vec::new();

        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            match fs::read_to_string(&path)
                .map_err(ScanError::from)
                .and_then(|c| serde_json::from_str::<ScanTaskRecord>(&c).map_err(ScanError::from))
            {
                Ok(record) => records.push(record),
                Err(e) => warn!("Skipping unreadable task file {}: {}", path.display(), e),
            }
        }

        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }

    fn delete(&self, task_id: &str) -> ScanResult<()> {
        let path = self.path_for(task_id)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(ScanError::TaskNotFound(task_id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}
