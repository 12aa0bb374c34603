//! In-memory collaborators and a scripted capture process for tests

use super::command::CaptureRequest;
use super::context::{Collaborators, RecorderContext, RecorderSettings};
use super::process::{CaptureSpawner, ProcessError, ProcessHandle};
use super::registry::ActiveCapture;
use super::state::{AudioFormat, AudioQuality, RecordingRecord, RecordingStatus, RecordingUpdate};
use crate::preflight::{Preflight, PreflightReport};
use crate::schedule::{ActiveSession, DayOfWeek, ScheduleSession, SessionTime, Station, WeeklySchedule};
use crate::store::{
    BlobStore, RecordingStore, ScheduleStore, StationSource, StoreError, StoredBlob,
};
use crate::utils::file_ops::LocalFileAccess;
use crate::utils::retry::RetryPolicy;
use async_trait::async_trait;
use chrono::{Datelike, FixedOffset, Timelike, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Scripted [`ProcessHandle`]
#[derive(Debug)]
pub struct FakeProcess {
    running: AtomicBool,
    exits_on_terminate: bool,
    diagnostics: String,
    terminate_calls: AtomicU32,
    kill_calls: AtomicU32,
}

impl FakeProcess {
    pub const PID: u32 = 4242;

    fn build(running: bool, exits_on_terminate: bool, diagnostics: &str) -> Arc<Self> {
        Arc::new(Self {
            running: AtomicBool::new(running),
            exits_on_terminate,
            diagnostics: diagnostics.to_string(),
            terminate_calls: AtomicU32::new(0),
            kill_calls: AtomicU32::new(0),
        })
    }

    /// Runs until terminated
    pub fn running() -> Arc<Self> {
        Self::build(true, true, "")
    }

    /// Already dead, with `diagnostics` as its last output
    pub fn exited(diagnostics: &str) -> Arc<Self> {
        Self::build(false, true, diagnostics)
    }

    /// Ignores terminate, only dies on force kill
    pub fn stubborn() -> Arc<Self> {
        Self::build(true, false, "")
    }

    pub fn terminate_calls(&self) -> u32 {
        self.terminate_calls.load(Ordering::SeqCst)
    }

    pub fn kill_calls(&self) -> u32 {
        self.kill_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProcessHandle for FakeProcess {
    fn pid(&self) -> Option<u32> {
        Some(Self::PID)
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn terminate(&self) -> Result<(), ProcessError> {
        self.terminate_calls.fetch_add(1, Ordering::SeqCst);
        if self.exits_on_terminate {
            self.running.store(false, Ordering::SeqCst);
        }
        Ok(())
    }

    fn force_kill(&self) -> Result<(), ProcessError> {
        self.kill_calls.fetch_add(1, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn diagnostics(&self) -> String {
        self.diagnostics.clone()
    }
}

/// Hands out queued processes (or healthy ones) and writes a fake capture file
#[derive(Default)]
pub struct FakeSpawner {
    queue: Mutex<VecDeque<Arc<FakeProcess>>>,
    fail_next: AtomicBool,
    requests: Mutex<Vec<CaptureRequest>>,
}

impl FakeSpawner {
    pub fn push(&self, process: Arc<FakeProcess>) {
        self.queue.lock().push_back(process);
    }

    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    pub fn spawn_count(&self) -> usize {
        self.requests.lock().len()
    }
}

impl CaptureSpawner for FakeSpawner {
    fn spawn(&self, request: &CaptureRequest) -> Result<Arc<dyn ProcessHandle>, ProcessError> {
        self.requests.lock().push(request.clone());
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(ProcessError::Spawn {
                program: "ffmpeg".to_string(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "not installed"),
            });
        }

        std::fs::write(&request.output_path, b"ID3 fake mp3 frames")?;
        let process: Arc<dyn ProcessHandle> =
            self.queue.lock().pop_front().unwrap_or_else(FakeProcess::running);
        Ok(process)
    }
}

/// Stations and schedules held in memory
#[derive(Default)]
pub struct MemoryCatalog {
    stations: Mutex<Vec<Station>>,
    schedules: Mutex<HashMap<String, WeeklySchedule>>,
    failures: AtomicU32,
}

impl MemoryCatalog {
    pub fn add(&self, station: Station, schedule: WeeklySchedule) {
        self.schedules.lock().insert(station.id.clone(), schedule);
        self.stations.lock().push(station);
    }

    pub fn set_active(&self, station_id: &str, active: bool) {
        if let Some(station) = self.stations.lock().iter_mut().find(|s| s.id == station_id) {
            station.is_active = active;
        }
    }

    /// Make the next `n` lookups fail
    pub fn fail_times(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(StoreError::Unavailable("catalog offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl StationSource for MemoryCatalog {
    async fn list_active_stations(&self) -> Result<Vec<Station>, StoreError> {
        self.check()?;
        Ok(self.stations.lock().iter().filter(|s| s.is_active).cloned().collect())
    }

    async fn get_station(&self, station_id: &str) -> Result<Option<Station>, StoreError> {
        self.check()?;
        Ok(self.stations.lock().iter().find(|s| s.id == station_id).cloned())
    }
}

#[async_trait]
impl ScheduleStore for MemoryCatalog {
    async fn get_schedule(&self, station_id: &str) -> Result<Option<WeeklySchedule>, StoreError> {
        Ok(self.schedules.lock().get(station_id).cloned())
    }

    async fn program_title(&self, program_id: &str) -> Result<Option<String>, StoreError> {
        Ok((program_id == "news").then(|| "Morning News".to_string()))
    }
}

/// Records held in memory, with the same state machine as the real store
#[derive(Default)]
pub struct MemoryRecords {
    records: Mutex<HashMap<String, RecordingRecord>>,
    next_id: AtomicU32,
}

impl MemoryRecords {
    pub fn get_sync(&self, id: &str) -> Option<RecordingRecord> {
        self.records.lock().get(id).cloned()
    }

    pub fn all(&self) -> Vec<RecordingRecord> {
        self.records.lock().values().cloned().collect()
    }
}

#[async_trait]
impl RecordingStore for MemoryRecords {
    async fn create(&self, mut record: RecordingRecord) -> Result<String, StoreError> {
        let id = format!("rec-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        record.id = id.clone();
        self.records.lock().insert(id.clone(), record);
        Ok(id)
    }

    async fn get(&self, id: &str) -> Result<Option<RecordingRecord>, StoreError> {
        Ok(self.get_sync(id))
    }

    async fn update(&self, id: &str, update: RecordingUpdate) -> Result<RecordingRecord, StoreError> {
        let mut records = self.records.lock();
        let record = records
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        record.apply(update)?;
        Ok(record.clone())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Blob store that keeps names and sizes
#[derive(Default)]
pub struct MemoryBlobs {
    saved: Mutex<Vec<(String, usize)>>,
    failure: Mutex<Option<String>>,
}

impl MemoryBlobs {
    pub fn saved(&self) -> Vec<(String, usize)> {
        self.saved.lock().clone()
    }

    pub fn fail_with(&self, message: &str) {
        *self.failure.lock() = Some(message.to_string());
    }
}

#[async_trait]
impl BlobStore for MemoryBlobs {
    async fn save(&self, bytes: Vec<u8>, suggested_name: &str) -> Result<StoredBlob, StoreError> {
        if let Some(message) = self.failure.lock().clone() {
            return Err(StoreError::Unavailable(message));
        }
        self.saved.lock().push((suggested_name.to_string(), bytes.len()));
        Ok(StoredBlob {
            path: format!("recordings/sessions/{}", suggested_name),
            url: format!("memory://recordings/sessions/{}", suggested_name),
        })
    }
}

/// Preflight with a fixed verdict
pub struct StaticPreflight {
    pub errors: Vec<String>,
}

#[async_trait]
impl Preflight for StaticPreflight {
    async fn run(&self) -> PreflightReport {
        let mut report = PreflightReport::default();
        for error in &self.errors {
            report.error(error.clone());
        }
        report
    }
}

pub fn utc() -> FixedOffset {
    FixedOffset::east_opt(0).unwrap()
}

pub fn schedule_session(start: &str, end: &str) -> ScheduleSession {
    ScheduleSession {
        program_id: Some("news".to_string()),
        start_time: start.parse().unwrap(),
        end_time: end.parse().unwrap(),
        studio: Some("Studio A".to_string()),
        host_ids: vec!["host-1".to_string()],
        is_live: true,
        is_repeat: false,
        notes: None,
    }
}

/// A session anchored to today (UTC)
pub fn active_session(start: &str, end: &str) -> ActiveSession {
    ActiveSession::new(schedule_session(start, end), Utc::now().date_naive(), utc())
}

/// A one-hour session that started in the current minute, scheduled on today's weekday
pub fn live_schedule() -> (WeeklySchedule, ScheduleSession) {
    let now = Utc::now();
    let start = SessionTime::new(now.hour() as u8, now.minute() as u8).unwrap();
    let end = SessionTime::new(((now.hour() + 1) % 24) as u8, now.minute() as u8).unwrap();
    let session = ScheduleSession {
        start_time: start,
        end_time: end,
        ..schedule_session("00:00", "01:00")
    };

    let mut schedule = WeeklySchedule::default();
    schedule
        .0
        .insert(DayOfWeek::from(now.weekday()), vec![session.clone()]);
    (schedule, session)
}

pub fn fast_settings(dir: &std::path::Path) -> RecorderSettings {
    RecorderSettings {
        recording_dir: dir.join("captures"),
        format: AudioFormat::Mp3,
        quality: AudioQuality::Kbps128,
        timezone: utc(),
        check_interval: Duration::from_millis(20),
        post_stop_grace: Duration::from_millis(20),
        liveness_probe: Duration::from_millis(5),
        max_consecutive_errors: 3,
        error_backoff_cap: Duration::from_millis(40),
        cleanup_timeout: Duration::from_millis(300),
        force_kill_grace: Duration::from_millis(200),
        handle_release_delay: Duration::ZERO,
        upload_timeout: Duration::from_secs(2),
        shutdown_timeout: Duration::from_secs(2),
        file_ops: RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(5)),
        orphan_cleanup: None,
    }
}

/// A context wired to in-memory collaborators
pub struct Harness {
    pub ctx: RecorderContext,
    pub catalog: Arc<MemoryCatalog>,
    pub records: Arc<MemoryRecords>,
    pub blobs: Arc<MemoryBlobs>,
    pub spawner: Arc<FakeSpawner>,
    pub collaborators: Collaborators,
    pub dir: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_preflight(Vec::new())
    }

    /// Harness whose preflight reports `errors`
    pub fn with_preflight(errors: Vec<String>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Arc::new(MemoryCatalog::default());
        let records = Arc::new(MemoryRecords::default());
        let blobs = Arc::new(MemoryBlobs::default());
        let spawner = Arc::new(FakeSpawner::default());

        let collaborators = Collaborators {
            stations: catalog.clone(),
            schedules: catalog.clone(),
            records: records.clone(),
            blobs: blobs.clone(),
            spawner: spawner.clone(),
            file_access: Arc::new(LocalFileAccess),
            preflight: Arc::new(StaticPreflight { errors }),
        };
        let ctx = RecorderContext::new(fast_settings(dir.path()), &collaborators);

        Self {
            ctx,
            catalog,
            records,
            blobs,
            spawner,
            collaborators,
            dir,
        }
    }

    pub fn station(&self) -> Station {
        Station {
            id: "radio-one".to_string(),
            name: "Radio One".to_string(),
            stream_url: "http://stream.example/one".to_string(),
            timezone: Some("UTC".to_string()),
            is_active: true,
        }
    }

    /// Register the default station with a session live right now
    pub fn add_live_station(&self) -> Station {
        let station = self.station();
        let (schedule, _) = live_schedule();
        self.catalog.add(station.clone(), schedule);
        station
    }

    pub fn session_now(&self) -> ActiveSession {
        let (_, session) = live_schedule();
        ActiveSession::new(session, Utc::now().date_naive(), utc())
    }

    pub fn record(&self, id: &str) -> RecordingRecord {
        self.records.get_sync(id).unwrap()
    }

    /// A capture with a `recording` record; `contents` is written as its file
    pub async fn recording_capture(
        &self,
        process: Arc<FakeProcess>,
        contents: Option<&[u8]>,
    ) -> ActiveCapture {
        let station = self.station();
        let session = self.session_now();
        let started_at = Utc::now();

        std::fs::create_dir_all(&self.ctx.settings.recording_dir).unwrap();
        let file_path = self.ctx.settings.recording_dir.join("radio_one_capture.mp3");
        if let Some(contents) = contents {
            std::fs::write(&file_path, contents).unwrap();
        }

        let mut record = RecordingRecord::scheduled(&station, &session, AudioFormat::Mp3, AudioQuality::Kbps128);
        record
            .apply(RecordingUpdate {
                status: Some(RecordingStatus::Recording),
                actual_start_time: Some(started_at),
                file_path: Some(file_path.display().to_string()),
                ..Default::default()
            })
            .unwrap();
        let recording_id = self.records.create(record).await.unwrap();

        ActiveCapture {
            key: session.key(&station.id),
            recording_id,
            file_path,
            started_at,
            session,
            process,
        }
    }
}
