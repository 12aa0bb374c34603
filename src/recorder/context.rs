//! Shared recorder context
//!
//! Everything a station supervisor needs, cheap to clone into each task.

use super::process::CaptureSpawner;
use super::registry::CaptureRegistry;
use super::state::{AudioFormat, AudioQuality, RecordingStatus};
use super::station::StationExit;
use crate::preflight::Preflight;
use crate::schedule::RecordingKey;
use crate::store::{BlobStore, RecordingStore, ScheduleStore, StationSource};
use crate::utils::file_ops::{FileAccess, RetryingFileOps};
use crate::utils::retry::RetryPolicy;
use chrono::{FixedOffset, Offset, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Runtime settings, resolved from configuration once at startup
#[derive(Debug, Clone)]
pub struct RecorderSettings {
    /// Directory captures are written to before upload
    pub recording_dir: PathBuf,

    pub format: AudioFormat,

    pub quality: AudioQuality,

    /// Default station timezone
    pub timezone: FixedOffset,

    pub check_interval: Duration,

    /// Extra pause after a capture was stopped
    pub post_stop_grace: Duration,

    /// Delay before checking that a fresh capture process is still alive
    pub liveness_probe: Duration,

    pub max_consecutive_errors: u32,

    pub error_backoff_cap: Duration,

    /// How long a terminated capture gets to exit before it is killed
    pub cleanup_timeout: Duration,

    pub force_kill_grace: Duration,

    /// Pause after process exit before touching its output file
    pub handle_release_delay: Duration,

    pub upload_timeout: Duration,

    pub shutdown_timeout: Duration,

    pub file_ops: RetryPolicy,

    /// Orphaned capture cleanup; `None` disables it
    pub orphan_cleanup: Option<OrphanCleanup>,
}

impl RecorderSettings {
    /// Longest a single start or stop can take: liveness probe, terminate,
    /// force kill, lock retries on read and delete, then the upload.
    pub fn finalize_budget(&self) -> Duration {
        self.liveness_probe
            + self.cleanup_timeout
            + self.force_kill_grace
            + self.handle_release_delay
            + self.file_ops.worst_case() * 2
            + self.upload_timeout
    }
}

/// Periodic removal of capture files nothing refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrphanCleanup {
    pub interval: Duration,
    pub max_age: Duration,
}

impl Default for RecorderSettings {
    fn default() -> Self {
        Self {
            recording_dir: PathBuf::from("temp_recordings"),
            format: AudioFormat::default(),
            quality: AudioQuality::default(),
            timezone: FixedOffset::east_opt(3 * 3600).unwrap_or_else(|| Utc.fix()),
            check_interval: Duration::from_secs(5),
            post_stop_grace: Duration::from_secs(30),
            liveness_probe: Duration::from_secs(3),
            max_consecutive_errors: 5,
            error_backoff_cap: Duration::from_secs(300),
            cleanup_timeout: Duration::from_secs(20),
            force_kill_grace: Duration::from_secs(1),
            handle_release_delay: if cfg!(windows) {
                Duration::from_secs(2)
            } else {
                Duration::ZERO
            },
            upload_timeout: Duration::from_secs(600),
            shutdown_timeout: Duration::from_secs(10),
            file_ops: RetryPolicy::default(),
            orphan_cleanup: None,
        }
    }
}

/// External systems the orchestrator works with
#[derive(Clone)]
pub struct Collaborators {
    pub stations: Arc<dyn StationSource>,
    pub schedules: Arc<dyn ScheduleStore>,
    pub records: Arc<dyn RecordingStore>,
    pub blobs: Arc<dyn BlobStore>,
    pub spawner: Arc<dyn CaptureSpawner>,
    pub file_access: Arc<dyn FileAccess>,
    pub preflight: Arc<dyn Preflight>,
}

/// Events emitted while recording
#[derive(Debug, Clone)]
pub enum RecorderEvent {
    /// Capture process is up and registered
    CaptureStarted {
        key: RecordingKey,
        recording_id: String,
    },
    /// Capture never got registered; the record is marked failed
    CaptureFailed {
        key: RecordingKey,
        recording_id: Option<String>,
        error: String,
    },
    /// Capture stopped and its record reached a terminal status
    CaptureFinalized {
        key: RecordingKey,
        recording_id: String,
        status: RecordingStatus,
    },
    /// A station supervisor loop ended
    StationExited { station_id: String, exit: StationExit },
}

/// State shared by the orchestrator and every station supervisor
#[derive(Clone)]
pub struct RecorderContext {
    pub stations: Arc<dyn StationSource>,
    pub schedules: Arc<dyn ScheduleStore>,
    pub records: Arc<dyn RecordingStore>,
    pub blobs: Arc<dyn BlobStore>,
    pub spawner: Arc<dyn CaptureSpawner>,
    pub files: RetryingFileOps,
    pub registry: CaptureRegistry,
    pub settings: Arc<RecorderSettings>,
    events: broadcast::Sender<RecorderEvent>,
}

impl RecorderContext {
    pub fn new(settings: RecorderSettings, collaborators: &Collaborators) -> Self {
        let (events, _) = broadcast::channel(100);
        Self {
            stations: collaborators.stations.clone(),
            schedules: collaborators.schedules.clone(),
            records: collaborators.records.clone(),
            blobs: collaborators.blobs.clone(),
            spawner: collaborators.spawner.clone(),
            files: RetryingFileOps::new(collaborators.file_access.clone(), settings.file_ops),
            registry: CaptureRegistry::new(),
            settings: Arc::new(settings),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RecorderEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: RecorderEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}
