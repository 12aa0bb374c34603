//! Configuration
//!
//! Loaded from TOML. Every section and field has a default, so an empty
//! file (or no file at all) is a valid configuration.

use crate::preflight::PreflightSettings;
use crate::recorder::context::{OrphanCleanup, RecorderSettings};
use crate::recorder::state::{AudioFormat, AudioQuality};
use crate::schedule::parse_utc_offset;
use crate::store::{JsonCatalog, JsonRecordingStore, LocalBlobStore};
use crate::utils::retry::RetryPolicy;
use crate::utils::{RecorderError, RecorderResult};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// File used when no `--config` is given
pub const DEFAULT_CONFIG_FILE: &str = "station-recorder.toml";

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub log: Log,
    #[serde(default)]
    pub recording: Recording,
    #[serde(default)]
    pub process: Process,
    #[serde(default)]
    pub file_ops: RetryPolicy,
    #[serde(default)]
    pub preflight: Preflight,
    #[serde(default)]
    pub storage: Storage,
    #[serde(default)]
    pub data: Data,
    #[serde(default)]
    pub cleanup: Cleanup,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Log {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for Log {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Recording {
    pub base_path: PathBuf,
    pub format: AudioFormat,
    pub quality: AudioQuality,
    /// Default station timezone as a UTC offset, e.g. `+03:00`
    pub timezone: String,
    pub check_interval_secs: u64,
    pub post_stop_grace_secs: u64,
    pub liveness_probe_secs: u64,
    pub max_consecutive_errors: u32,
    pub error_backoff_cap_secs: u64,
    pub shutdown_timeout_secs: u64,
    pub upload_timeout_secs: u64,
}

impl Default for Recording {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from("./temp_recordings"),
            format: AudioFormat::Mp3,
            quality: AudioQuality::Kbps128,
            timezone: "+03:00".to_string(),
            check_interval_secs: 5,
            post_stop_grace_secs: 30,
            liveness_probe_secs: 3,
            max_consecutive_errors: 5,
            error_backoff_cap_secs: 300,
            shutdown_timeout_secs: 10,
            upload_timeout_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Process {
    pub ffmpeg_path: String,
    pub cleanup_timeout_secs: u64,
    pub force_kill_grace_ms: u64,
    /// Pause before touching a capture file after its process exited
    pub handle_release_delay_ms: u64,
}

impl Default for Process {
    fn default() -> Self {
        Self {
            ffmpeg_path: "ffmpeg".to_string(),
            cleanup_timeout_secs: 20,
            force_kill_grace_ms: 1000,
            handle_release_delay_ms: if cfg!(windows) { 2000 } else { 0 },
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Preflight {
    pub min_disk_gb: f64,
    pub min_memory_gb: f64,
    pub min_cpu_count: usize,
    pub check_timeout_secs: u64,
}

impl Default for Preflight {
    fn default() -> Self {
        Self {
            min_disk_gb: 5.0,
            min_memory_gb: 1.0,
            min_cpu_count: 2,
            check_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Storage {
    pub upload_dir: PathBuf,
    pub sub_dir: String,
    pub base_url: String,
    pub allowed_extensions: Vec<String>,
}

impl Default for Storage {
    fn default() -> Self {
        Self {
            upload_dir: PathBuf::from("static/uploads"),
            sub_dir: "recordings/sessions".to_string(),
            base_url: "http://localhost:8000".to_string(),
            allowed_extensions: ["mp3", "wav", "aac", "m4a", "ogg", "flac"]
                .iter()
                .map(|e| e.to_string())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Data {
    /// JSON file with stations, schedules and program titles
    pub catalog_path: PathBuf,
    /// Directory holding one JSON file per recording
    pub records_dir: PathBuf,
}

impl Default for Data {
    fn default() -> Self {
        Self {
            catalog_path: PathBuf::from("stations.json"),
            records_dir: PathBuf::from("data/recordings"),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Cleanup {
    pub enabled: bool,
    pub interval_secs: u64,
    pub max_age_secs: u64,
}

impl Default for Cleanup {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: 1800,
            max_age_secs: 3600,
        }
    }
}

impl Config {
    /// Load from `path`, or from [`DEFAULT_CONFIG_FILE`] if it exists, or
    /// fall back to defaults.
    pub fn load(path: Option<&str>) -> anyhow::Result<Self> {
        let path = match path {
            Some(path) => PathBuf::from(path),
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => PathBuf::from(DEFAULT_CONFIG_FILE),
            None => return Ok(Self::default()),
        };

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config = Self::parse(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        Ok(config)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> RecorderResult<()> {
        let invalid = |message: &str| Err(RecorderError::Config(message.to_string()));

        parse_utc_offset(&self.recording.timezone)
            .map_err(|e| RecorderError::Config(format!("recording.timezone: {}", e)))?;

        if self.recording.check_interval_secs == 0 {
            return invalid("recording.check_interval_secs must be greater than 0");
        }
        if self.recording.max_consecutive_errors == 0 {
            return invalid("recording.max_consecutive_errors must be greater than 0");
        }
        if self.recording.shutdown_timeout_secs == 0 {
            return invalid("recording.shutdown_timeout_secs must be greater than 0");
        }
        if self.recording.upload_timeout_secs == 0 {
            return invalid("recording.upload_timeout_secs must be greater than 0");
        }
        if self.process.ffmpeg_path.trim().is_empty() {
            return invalid("process.ffmpeg_path must not be empty");
        }
        if self.file_ops.max_attempts == 0 {
            return invalid("file_ops.max_attempts must be greater than 0");
        }
        if self.file_ops.base_delay_ms > self.file_ops.max_delay_ms {
            return invalid("file_ops.base_delay_ms must not exceed file_ops.max_delay_ms");
        }
        if self.storage.allowed_extensions.is_empty() {
            return invalid("storage.allowed_extensions must not be empty");
        }
        if self.cleanup.enabled && self.cleanup.interval_secs == 0 {
            return invalid("cleanup.interval_secs must be greater than 0");
        }
        Ok(())
    }

    pub fn recorder_settings(&self) -> RecorderResult<RecorderSettings> {
        let recording = &self.recording;
        let timezone = parse_utc_offset(&recording.timezone).map_err(RecorderError::Config)?;

        Ok(RecorderSettings {
            recording_dir: recording.base_path.clone(),
            format: recording.format,
            quality: recording.quality,
            timezone,
            check_interval: Duration::from_secs(recording.check_interval_secs),
            post_stop_grace: Duration::from_secs(recording.post_stop_grace_secs),
            liveness_probe: Duration::from_secs(recording.liveness_probe_secs),
            max_consecutive_errors: recording.max_consecutive_errors,
            error_backoff_cap: Duration::from_secs(recording.error_backoff_cap_secs),
            cleanup_timeout: Duration::from_secs(self.process.cleanup_timeout_secs),
            force_kill_grace: Duration::from_millis(self.process.force_kill_grace_ms),
            handle_release_delay: Duration::from_millis(self.process.handle_release_delay_ms),
            upload_timeout: Duration::from_secs(recording.upload_timeout_secs),
            shutdown_timeout: Duration::from_secs(recording.shutdown_timeout_secs),
            file_ops: self.file_ops,
            orphan_cleanup: self.cleanup.enabled.then(|| OrphanCleanup {
                interval: Duration::from_secs(self.cleanup.interval_secs),
                max_age: Duration::from_secs(self.cleanup.max_age_secs),
            }),
        })
    }

    pub fn preflight_settings(&self) -> PreflightSettings {
        PreflightSettings {
            min_disk_gb: self.preflight.min_disk_gb,
            min_memory_gb: self.preflight.min_memory_gb,
            min_cpu_count: self.preflight.min_cpu_count,
            check_timeout: Duration::from_secs(self.preflight.check_timeout_secs),
        }
    }

    pub fn catalog(&self) -> JsonCatalog {
        JsonCatalog::new(&self.data.catalog_path)
    }

    pub fn record_store(&self) -> JsonRecordingStore {
        JsonRecordingStore::new(&self.data.records_dir)
    }

    pub fn blob_store(&self) -> LocalBlobStore {
        LocalBlobStore::new(
            &self.storage.upload_dir,
            self.storage.sub_dir.as_str(),
            self.storage.base_url.as_str(),
            self.storage.allowed_extensions.clone(),
        )
    }
}
