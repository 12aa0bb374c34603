//! Collaborator interfaces
//!
//! The recorder reads stations and schedules, writes recording records and
//! hands finished audio to a blob store. These traits are the only way it
//! reaches those systems; the submodules provide file-backed versions used
//! by the `station-recorder` binary.

pub mod blob;
pub mod catalog;
pub mod records;

pub use blob::LocalBlobStore;
pub use catalog::JsonCatalog;
pub use records::JsonRecordingStore;

use crate::recorder::state::{InvalidTransition, RecordingRecord, RecordingUpdate};
use crate::schedule::{Station, WeeklySchedule};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io::{self, Write};
use std::path::Path;
use tempfile::NamedTempFile;
use thiserror::Error;

/// Collaborator failures
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    #[error("rejected: {0}")]
    Rejected(String),

    #[error("unavailable: {0}")]
    Unavailable(String),
}

/// Source of the stations to record
#[async_trait]
pub trait StationSource: Send + Sync {
    async fn list_active_stations(&self) -> Result<Vec<Station>, StoreError>;

    /// `None` if the station no longer exists
    async fn get_station(&self, station_id: &str) -> Result<Option<Station>, StoreError>;
}

/// Weekly program schedules
#[async_trait]
pub trait ScheduleStore: Send + Sync {
    /// `None` if the station has no schedule
    async fn get_schedule(&self, station_id: &str) -> Result<Option<WeeklySchedule>, StoreError>;

    /// Display title of a program, used in capture file names
    async fn program_title(&self, _program_id: &str) -> Result<Option<String>, StoreError> {
        Ok(None)
    }
}

/// Persistence for [`RecordingRecord`]s
#[async_trait]
pub trait RecordingStore: Send + Sync {
    /// Store a new record and return its id
    async fn create(&self, record: RecordingRecord) -> Result<String, StoreError>;

    async fn get(&self, id: &str) -> Result<Option<RecordingRecord>, StoreError>;

    /// Apply `update` and return the updated record
    async fn update(&self, id: &str, update: RecordingUpdate) -> Result<RecordingRecord, StoreError>;

    /// Cheap reachability check
    async fn ping(&self) -> Result<(), StoreError>;
}

/// Where a blob ended up
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredBlob {
    /// Storage-assigned path
    pub path: String,

    /// Publicly reachable URL
    pub url: String,
}

/// Durable storage for finished captures
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn save(&self, bytes: Vec<u8>, suggested_name: &str) -> Result<StoredBlob, StoreError>;
}

/// Write `contents` to `path` through a temp file in the same directory and
/// a rename, so readers never see a partial file.
pub(crate) fn atomic_write(path: &Path, contents: &[u8]) -> io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(contents)?;
    tmp.flush()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// [`atomic_write`] off the async runtime
pub(crate) async fn atomic_write_async(path: &Path, contents: Vec<u8>) -> io::Result<()> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || atomic_write(&path, &contents))
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
}
