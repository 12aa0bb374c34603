//! Recording records as JSON files
//!
//! One `{id}.json` file per record inside a directory. Writes are atomic and
//! serialized through a lock so concurrent finalizations never interleave.

use super::{atomic_write_async, RecordingStore, StoreError};
use crate::recorder::state::{RecordingRecord, RecordingUpdate};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use uuid::Uuid;

/// Record store backed by a directory of JSON files
#[derive(Debug)]
pub struct JsonRecordingStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonRecordingStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    async fn read(&self, id: &str) -> Result<Option<RecordingRecord>, StoreError> {
        let content = match tokio::fs::read_to_string(self.record_path(id)).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_str(&content)?))
    }

    async fn write(&self, record: &RecordingRecord) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let content = serde_json::to_vec_pretty(record)?;
        atomic_write_async(&self.record_path(&record.id), content).await?;
        Ok(())
    }

    /// Every record in the directory, oldest first
    pub async fn list(&self) -> Result<Vec<RecordingRecord>, StoreError> {
        let mut records = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(records),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let content = tokio::fs::read_to_string(&path).await?;
            match serde_json::from_str::<RecordingRecord>(&content) {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!("Skipping unreadable record {:?}: {}", path, e),
            }
        }

        records.sort_by_key(|record| record.created_at);
        Ok(records)
    }
}

#[async_trait]
impl RecordingStore for JsonRecordingStore {
    async fn create(&self, mut record: RecordingRecord) -> Result<String, StoreError> {
        let _guard = self.write_lock.lock().await;
        record.id = Uuid::new_v4().to_string();
        self.write(&record).await?;
        tracing::debug!("Created recording record {}", record.id);
        Ok(record.id)
    }

    async fn get(&self, id: &str) -> Result<Option<RecordingRecord>, StoreError> {
        self.read(id).await
    }

    async fn update(&self, id: &str, update: RecordingUpdate) -> Result<RecordingRecord, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut record = self
            .read(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("recording {}", id)))?;
        record.apply(update)?;
        self.write(&record).await?;
        Ok(record)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.dir).await.map_err(|e| {
            StoreError::Unavailable(format!("record directory {}: {}", self.dir.display(), e))
        })?;

        let metadata = tokio::fs::metadata(&self.dir).await?;
        if metadata.permissions().readonly() {
            return Err(StoreError::Unavailable(format!(
                "record directory {} is read-only",
                self.dir.display()
            )));
        }
        Ok(())
    }
}
