//! Startup validation
//!
//! Everything the recorder needs before any station loop is spawned: a
//! working FFmpeg, a writable capture directory, a reachable record store.
//! Disk, memory and CPU shortfalls only produce warnings.

use crate::store::RecordingStore;
use crate::utils::retry::{retry_with_backoff, RetryPolicy};
use async_trait::async_trait;
use chrono::{FixedOffset, Local, Offset, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use sysinfo::{Disks, System};
use tokio::process::Command;

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Host facts gathered during validation
#[derive(Debug, Clone, Default, Serialize)]
pub struct SystemInfo {
    pub platform: String,
    pub arch: String,
    pub os_version: Option<String>,
    pub ffmpeg_path: String,
    pub ffmpeg_version: Option<String>,
    pub available_disk_gb: Option<f64>,
    pub total_memory_gb: f64,
    pub cpu_count: usize,
    pub timezone: String,
}

/// Outcome of a validation run
#[derive(Debug, Clone, Serialize)]
pub struct PreflightReport {
    pub passed: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub system_info: SystemInfo,
}

impl Default for PreflightReport {
    fn default() -> Self {
        Self {
            passed: true,
            errors: Vec::new(),
            warnings: Vec::new(),
            system_info: SystemInfo::default(),
        }
    }
}

impl PreflightReport {
    /// Record a blocking problem
    pub fn error(&mut self, message: String) {
        self.passed = false;
        self.errors.push(message);
    }

    pub fn warning(&mut self, message: String) {
        self.warnings.push(message);
    }

    pub fn log(&self) {
        let info = &self.system_info;
        tracing::info!(
            "System: {} {} ({}), {} CPU(s), {:.1} GB RAM, timezone {}",
            info.platform,
            info.os_version.as_deref().unwrap_or("unknown"),
            info.arch,
            info.cpu_count,
            info.total_memory_gb,
            info.timezone
        );
        if let Some(version) = &info.ffmpeg_version {
            tracing::info!("FFmpeg: {} ({})", version, info.ffmpeg_path);
        }
        for warning in &self.warnings {
            tracing::warn!("Preflight: {}", warning);
        }
        for error in &self.errors {
            tracing::error!("Preflight: {}", error);
        }
        if self.passed {
            tracing::info!("Preflight passed with {} warning(s)", self.warnings.len());
        } else {
            tracing::error!("Preflight failed with {} error(s)", self.errors.len());
        }
    }
}

/// Something that can vouch for the host before recording starts
#[async_trait]
pub trait Preflight: Send + Sync {
    async fn run(&self) -> PreflightReport;
}

/// Thresholds for [`PreflightValidator`]
#[derive(Debug, Clone)]
pub struct PreflightSettings {
    pub min_disk_gb: f64,
    pub min_memory_gb: f64,
    pub min_cpu_count: usize,
    /// Per external check (FFmpeg probe, store ping)
    pub check_timeout: Duration,
}

impl Default for PreflightSettings {
    fn default() -> Self {
        Self {
            min_disk_gb: 5.0,
            min_memory_gb: 1.0,
            min_cpu_count: 2,
            check_timeout: Duration::from_secs(10),
        }
    }
}

/// Checks the real host
pub struct PreflightValidator {
    settings: PreflightSettings,
    recording_dir: PathBuf,
    ffmpeg_path: String,
    timezone: FixedOffset,
    records: Arc<dyn RecordingStore>,
}

impl PreflightValidator {
    pub fn new(
        settings: PreflightSettings,
        recording_dir: impl Into<PathBuf>,
        ffmpeg_path: impl Into<String>,
        timezone: FixedOffset,
        records: Arc<dyn RecordingStore>,
    ) -> Self {
        Self {
            settings,
            recording_dir: recording_dir.into(),
            ffmpeg_path: ffmpeg_path.into(),
            timezone,
            records,
        }
    }

    async fn check_ffmpeg(&self, report: &mut PreflightReport) {
        report.system_info.ffmpeg_path = self.ffmpeg_path.clone();

        let probe = Command::new(&self.ffmpeg_path)
            .arg("-version")
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true)
            .output();

        match tokio::time::timeout(self.settings.check_timeout, probe).await {
            Err(_) => report.error(format!(
                "FFmpeg did not answer -version within {:?}",
                self.settings.check_timeout
            )),
            Ok(Err(e)) => report.error(format!("FFmpeg not found at '{}': {}", self.ffmpeg_path, e)),
            Ok(Ok(output)) if !output.status.success() => {
                report.error(format!("FFmpeg -version exited with {}", output.status))
            }
            Ok(Ok(output)) => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                match parse_ffmpeg_version(&stdout) {
                    Some(version) => report.system_info.ffmpeg_version = Some(version),
                    None => report.error(format!(
                        "'{}' does not look like FFmpeg",
                        self.ffmpeg_path
                    )),
                }
            }
        }
    }

    async fn check_recording_dir(&self, report: &mut PreflightReport) {
        if let Err(e) = probe_writable(&self.recording_dir).await {
            report.error(format!(
                "Recording directory {:?} is not writable: {}",
                self.recording_dir, e
            ));
        }
    }

    fn check_disk(&self, report: &mut PreflightReport) {
        let disks = Disks::new_with_refreshed_list();
        let target = std::fs::canonicalize(&self.recording_dir).unwrap_or_else(|_| self.recording_dir.clone());

        let available = disks
            .list()
            .iter()
            .filter(|disk| target.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len())
            .map(|disk| disk.available_space() as f64 / BYTES_PER_GB);

        report.system_info.available_disk_gb = available;
        match available {
            Some(gb) if gb < self.settings.min_disk_gb => report.warning(format!(
                "Only {:.1} GB free for recordings (recommended {:.1} GB)",
                gb, self.settings.min_disk_gb
            )),
            Some(_) => {}
            None => report.warning(format!("Could not determine free disk space for {:?}", target)),
        }
    }

    fn check_host(&self, report: &mut PreflightReport) {
        let mut sys = System::new();
        sys.refresh_memory();
        sys.refresh_cpu();

        let memory_gb = sys.total_memory() as f64 / BYTES_PER_GB;
        let cpu_count = sys.cpus().len();

        let info = &mut report.system_info;
        info.platform = std::env::consts::OS.to_string();
        info.arch = std::env::consts::ARCH.to_string();
        info.os_version = System::long_os_version().or_else(System::os_version);
        info.total_memory_gb = memory_gb;
        info.cpu_count = cpu_count;

        if memory_gb < self.settings.min_memory_gb {
            report.warning(format!(
                "Only {:.1} GB of memory (recommended {:.1} GB)",
                memory_gb, self.settings.min_memory_gb
            ));
        }
        if cpu_count < self.settings.min_cpu_count {
            report.warning(format!(
                "Only {} CPU(s) (recommended {})",
                cpu_count, self.settings.min_cpu_count
            ));
        }
    }

    fn check_timezone(&self, report: &mut PreflightReport) {
        report.system_info.timezone = self.timezone.to_string();

        let local = Local::now().offset().fix();
        if local != self.timezone {
            report.warning(format!(
                "Host clock is at {} but schedules are resolved at {}",
                local, self.timezone
            ));
        }
        tracing::debug!("Schedule time now: {}", Utc::now().with_timezone(&self.timezone));
    }

    async fn check_store(&self, report: &mut PreflightReport) {
        let policy = RetryPolicy::new(3, Duration::from_millis(500), Duration::from_secs(2));
        let ping = retry_with_backoff(&policy, |_| true, |_| self.records.ping());

        match tokio::time::timeout(self.settings.check_timeout, ping).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => report.error(format!("Recording store unavailable: {}", e)),
            Err(_) => report.error(format!(
                "Recording store did not answer within {:?}",
                self.settings.check_timeout
            )),
        }
    }
}

#[async_trait]
impl Preflight for PreflightValidator {
    async fn run(&self) -> PreflightReport {
        tracing::info!("Running preflight checks");
        let mut report = PreflightReport::default();

        self.check_host(&mut report);
        self.check_ffmpeg(&mut report).await;
        self.check_recording_dir(&mut report).await;
        self.check_disk(&mut report);
        self.check_store(&mut report).await;
        self.check_timezone(&mut report);

        report
    }
}

/// "ffmpeg version 6.1.1 Copyright ..." -> "6.1.1"
fn parse_ffmpeg_version(output: &str) -> Option<String> {
    let first = output.lines().next()?.trim();
    let rest = first.strip_prefix("ffmpeg version ")?;
    rest.split_whitespace().next().map(str::to_string)
}

/// Create `dir` and round-trip a small file through it
async fn probe_writable(dir: &Path) -> std::io::Result<()> {
    tokio::fs::create_dir_all(dir).await?;

    let probe = dir.join(format!(".preflight_{}", std::process::id()));
    tokio::fs::write(&probe, b"preflight").await?;
    let read_back = tokio::fs::read(&probe).await;
    tokio::fs::remove_file(&probe).await?;

    if read_back? != b"preflight" {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "probe file read back differently",
        ));
    }
    Ok(())
}
