//! Recording state management
//!
//! Defines the recording status state machine and the persisted record of
//! one capture attempt.

use crate::schedule::{ActiveSession, DayOfWeek, Station};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Status of a recording record
///
/// `scheduled -> recording -> {completed, failed}`; both end states are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordingStatus {
    /// Record exists, capture not started yet
    Scheduled,
    /// Capture process is running
    Recording,
    /// Audio uploaded to the blob store
    Completed,
    /// Capture or finalization failed, see `error_message`
    Failed,
}

impl Default for RecordingStatus {
    fn default() -> Self {
        Self::Scheduled
    }
}

impl RecordingStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RecordingStatus::Completed | RecordingStatus::Failed)
    }

    pub fn can_transition_to(&self, next: RecordingStatus) -> bool {
        use RecordingStatus::*;
        matches!(
            (*self, next),
            (Scheduled, Recording)
                | (Scheduled, Failed)
                | (Recording, Completed)
                | (Recording, Failed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RecordingStatus::Scheduled => "scheduled",
            RecordingStatus::Recording => "recording",
            RecordingStatus::Completed => "completed",
            RecordingStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for RecordingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rejected status change
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("invalid status transition from {from} to {to}")]
pub struct InvalidTransition {
    pub from: RecordingStatus,
    pub to: RecordingStatus,
}

/// Output container/codec of a capture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    Mp3,
    Aac,
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self::Mp3
    }
}

impl AudioFormat {
    /// File extension for this format
    pub fn extension(&self) -> &'static str {
        match self {
            AudioFormat::Mp3 => "mp3",
            AudioFormat::Aac => "aac",
        }
    }

    /// FFmpeg audio encoder for this format
    pub fn codec(&self) -> &'static str {
        match self {
            AudioFormat::Mp3 => "libmp3lame",
            AudioFormat::Aac => "aac",
        }
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// Bitrate preset; sample rate follows from it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AudioQuality {
    #[serde(rename = "64kbps")]
    Kbps64,
    #[serde(rename = "128kbps")]
    Kbps128,
    #[serde(rename = "192kbps")]
    Kbps192,
    #[serde(rename = "256kbps")]
    Kbps256,
    #[serde(rename = "320kbps")]
    Kbps320,
}

impl Default for AudioQuality {
    fn default() -> Self {
        Self::Kbps128
    }
}

impl AudioQuality {
    pub fn bitrate_kbps(&self) -> u32 {
        match self {
            AudioQuality::Kbps64 => 64,
            AudioQuality::Kbps128 => 128,
            AudioQuality::Kbps192 => 192,
            AudioQuality::Kbps256 => 256,
            AudioQuality::Kbps320 => 320,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        match self {
            AudioQuality::Kbps64 => 22_050,
            _ => 44_100,
        }
    }

    pub fn channels(&self) -> u32 {
        2
    }
}

impl fmt::Display for AudioQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}kbps", self.bitrate_kbps())
    }
}

/// Persisted metadata of one capture attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordingRecord {
    /// Assigned by the record store on create
    #[serde(default)]
    pub id: String,

    pub station_id: String,

    pub program_id: Option<String>,

    pub session_date: NaiveDate,

    pub day_of_week: DayOfWeek,

    pub scheduled_start_time: NaiveTime,

    pub scheduled_end_time: NaiveTime,

    pub actual_start_time: Option<DateTime<Utc>>,

    pub actual_end_time: Option<DateTime<Utc>>,

    pub recording_status: RecordingStatus,

    pub stream_url: String,

    pub file_path: Option<String>,

    pub file_url: Option<String>,

    pub file_size_mb: Option<f64>,

    pub duration_minutes: Option<f64>,

    pub audio_format: AudioFormat,

    pub audio_quality: AudioQuality,

    pub studio: Option<String>,

    pub host_ids: Vec<String>,

    pub notes: Option<String>,

    pub is_live_session: bool,

    pub is_repeat_session: bool,

    /// OS pid of the capture process while it runs
    pub recording_process_id: Option<u32>,

    pub error_message: Option<String>,

    pub retry_count: u32,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl RecordingRecord {
    /// A `scheduled` record for `active` on `station`
    pub fn scheduled(
        station: &Station,
        active: &ActiveSession,
        audio_format: AudioFormat,
        audio_quality: AudioQuality,
    ) -> Self {
        let session = &active.session;
        let now = Utc::now();
        Self {
            id: String::new(),
            station_id: station.id.clone(),
            program_id: session.program_id.clone(),
            session_date: active.session_date,
            day_of_week: active.day_of_week,
            scheduled_start_time: session.start_time.to_naive(),
            scheduled_end_time: session.end_time.to_naive(),
            actual_start_time: None,
            actual_end_time: None,
            recording_status: RecordingStatus::Scheduled,
            stream_url: station.stream_url.clone(),
            file_path: None,
            file_url: None,
            file_size_mb: None,
            duration_minutes: None,
            audio_format,
            audio_quality,
            studio: session.studio.clone(),
            host_ids: session.host_ids.clone(),
            notes: session.notes.clone(),
            is_live_session: session.is_live,
            is_repeat_session: session.is_repeat,
            recording_process_id: None,
            error_message: None,
            retry_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply `update`, enforcing the status state machine. Records in a
    /// terminal state reject every update.
    pub fn apply(&mut self, update: RecordingUpdate) -> Result<(), InvalidTransition> {
        if self.recording_status.is_terminal() {
            return Err(InvalidTransition {
                from: self.recording_status,
                to: update.status.unwrap_or(self.recording_status),
            });
        }

        if let Some(next) = update.status {
            if next != self.recording_status && !self.recording_status.can_transition_to(next) {
                return Err(InvalidTransition {
                    from: self.recording_status,
                    to: next,
                });
            }
            self.recording_status = next;
        }

        if let Some(value) = update.actual_start_time {
            self.actual_start_time = Some(value);
        }
        if let Some(value) = update.actual_end_time {
            self.actual_end_time = Some(value);
        }
        if let Some(value) = update.file_path {
            self.file_path = Some(value);
        }
        if let Some(value) = update.file_url {
            self.file_url = Some(value);
        }
        if let Some(value) = update.file_size_mb {
            self.file_size_mb = Some(value);
        }
        if let Some(value) = update.duration_minutes {
            self.duration_minutes = Some(value);
        }
        if let Some(value) = update.recording_process_id {
            self.recording_process_id = value;
        }
        if let Some(value) = update.error_message {
            self.error_message = value;
        }

        self.updated_at = Utc::now();
        Ok(())
    }
}

/// Partial update of a [`RecordingRecord`]; `None` leaves a field untouched
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordingUpdate {
    pub status: Option<RecordingStatus>,
    pub actual_start_time: Option<DateTime<Utc>>,
    pub actual_end_time: Option<DateTime<Utc>>,
    pub file_path: Option<String>,
    pub file_url: Option<String>,
    pub file_size_mb: Option<f64>,
    pub duration_minutes: Option<f64>,
    /// `Some(None)` clears the pid
    pub recording_process_id: Option<Option<u32>>,
    /// `Some(None)` clears the message
    pub error_message: Option<Option<String>>,
}

impl RecordingUpdate {
    /// Terminal `failed` update with end time and duration filled in
    pub fn failed(started_at: DateTime<Utc>, ended_at: DateTime<Utc>, message: impl Into<String>) -> Self {
        Self {
            status: Some(RecordingStatus::Failed),
            actual_end_time: Some(ended_at),
            duration_minutes: Some(duration_minutes(started_at, ended_at)),
            recording_process_id: Some(None),
            error_message: Some(Some(message.into())),
            ..Default::default()
        }
    }
}

/// Minutes between two instants, rounded to one decimal
pub fn duration_minutes(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    let minutes = (end - start).num_milliseconds() as f64 / 60_000.0;
    (minutes.max(0.0) * 10.0).round() / 10.0
}

/// Bytes to megabytes, rounded to two decimals
pub fn size_mb(bytes: u64) -> f64 {
    (bytes as f64 / (1024.0 * 1024.0) * 100.0).round() / 100.0
}
