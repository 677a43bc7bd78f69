use std::path::{Path, PathBuf};

use tracing::{error, warn};

use crate::error::Result;
use crate::types::TaskInfo;

/// Two files per task under the storage directory:
/// `<task_id>.json` (metadata) and `<task_id>.payload` (opaque bytes).
pub struct TaskPersistence {
    dir: PathBuf,
}

impl TaskPersistence {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn meta_path(&self, task_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", task_id))
    }

    fn payload_path(&self, task_id: &str) -> PathBuf {
        self.dir.join(format!("{}.payload", task_id))
    }

    /// Persist metadata and, when given, the payload. Metadata is written
    /// atomically via a temp file so a crash never leaves half a record.
    pub fn save(&self, info: &TaskInfo, payload: Option<&[u8]>) -> Result<()> {
        let tmp = self.dir.join(format!("{}.json.tmp", info.task_id));
        std::fs::write(&tmp, serde_json::to_vec_pretty(info)?)?;
        std::fs::rename(&tmp, self.meta_path(&info.task_id))?;
        if let Some(bytes) = payload {
            std::fs::write(self.payload_path(&info.task_id), bytes)?;
        }
        Ok(())
    }

    pub fn load(&self, task_id: &str) -> Option<(TaskInfo, Vec<u8>)> {
        let meta = std::fs::read(self.meta_path(task_id)).ok()?;
        let info: TaskInfo = match serde_json::from_slice(&meta) {
            Ok(info) => info,
            Err(e) => {
                error!(task_id, "corrupt task metadata: {e}");
                return None;
            }
        };
        let payload = std::fs::read(self.payload_path(task_id)).unwrap_or_default();
        Some((info, payload))
    }

    pub fn delete(&self, task_id: &str) {
        for path in [self.meta_path(task_id), self.payload_path(task_id)] {
            if path.exists() {
                if let Err(e) = std::fs::remove_file(&path) {
                    warn!(path = %path.display(), "failed to delete task file: {e}");
                }
            }
        }
    }

    /// All task ids with a metadata file present.
    pub fn list(&self) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        entries
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                let name = e.file_name().to_string_lossy().into_owned();
                name.strip_suffix(".json").map(str::to_string)
            })
            .collect()
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{TaskPriority, TaskStatus};
    use chrono::Utc;

    fn info(id: &str) -> TaskInfo {
        TaskInfo {
            task_id: id.into(),
            task_type: "ingest_document".into(),
            priority: TaskPriority::Normal,
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            retry_count: 0,
            max_retries: 3,
            timeout_secs: 300,
            progress: 0.0,
            result: None,
            error: None,
            metadata: serde_json::json!({}),
        }
    }

    #[test]
    fn save_load_delete_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let p = TaskPersistence::new(dir.path()).unwrap();
        p.save(&info("t1"), Some(b"payload-bytes")).unwrap();

        let (loaded, payload) = p.load("t1").unwrap();
        assert_eq!(loaded.task_type, "ingest_document");
        assert_eq!(payload, b"payload-bytes");
        assert_eq!(p.list(), vec!["t1".to_string()]);

        p.delete("t1");
        assert!(p.load("t1").is_none());
        assert!(p.list().is_empty());
    }
}
