//! Recording orchestrator
//!
//! Owns one supervisor task per active station, validates the host before
//! the first start, and tears everything down in order on shutdown: stop
//! admitting captures, finalize the ones running, then cancel the loops.

use super::capture::stop_capture;
use super::context::{Collaborators, RecorderContext, RecorderEvent, RecorderSettings};
use super::janitor;
use super::registry::CaptureStatus;
use super::station::{StationExit, StationSupervisor};
use crate::preflight::{Preflight, PreflightReport};
use crate::utils::retry::{poll_until, RetryPolicy};
use crate::utils::{RecorderError, RecorderResult};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(50);

struct StationTask {
    name: String,
    token: CancellationToken,
    handle: JoinHandle<StationExit>,
}

struct Background {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct LifecycleState {
    validated: bool,
    started_at: Option<DateTime<Utc>>,
    report: Option<PreflightReport>,
}

/// What `stop_all` managed to do
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownSummary {
    /// Captures finalized during shutdown
    pub finalized: usize,
    /// Station tasks stopped
    pub station_tasks: usize,
    /// Captures or tasks that did not finish within the drain timeout
    pub timed_out: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct StationStatus {
    pub name: String,
    pub task_running: bool,
    pub active_recordings: usize,
    pub last_exit: Option<StationExit>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SettingsSummary {
    pub check_interval_secs: f64,
    pub cleanup_timeout_secs: f64,
    pub file_ops: RetryPolicy,
    pub timezone: String,
    pub recording_dir: String,
}

/// Snapshot of the orchestrator for status endpoints and logs
#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorStatus {
    pub validated: bool,
    pub running: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub uptime_seconds: Option<i64>,
    pub stations: BTreeMap<String, StationStatus>,
    pub active_recordings: BTreeMap<String, CaptureStatus>,
    pub preflight: Option<PreflightReport>,
    pub settings: SettingsSummary,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub total_stations: usize,
    pub running_stations: usize,
    pub dead_station_tasks: usize,
    pub active_recordings: usize,
    pub zombie_processes: usize,
    pub validated: bool,
    pub uptime_seconds: Option<i64>,
}

/// Runs every station supervisor
pub struct Orchestrator {
    ctx: RecorderContext,
    preflight: Arc<dyn Preflight>,
    tasks: Mutex<HashMap<String, StationTask>>,
    exits: Arc<Mutex<HashMap<String, StationExit>>>,
    state: RwLock<LifecycleState>,
    janitor: Mutex<Option<Background>>,
}

impl Orchestrator {
    pub fn new(settings: RecorderSettings, collaborators: Collaborators) -> Self {
        Self {
            ctx: RecorderContext::new(settings, &collaborators),
            preflight: collaborators.preflight.clone(),
            tasks: Mutex::new(HashMap::new()),
            exits: Arc::new(Mutex::new(HashMap::new())),
            state: RwLock::new(LifecycleState::default()),
            janitor: Mutex::new(None),
        }
    }

    pub fn context(&self) -> &RecorderContext {
        &self.ctx
    }

    /// Subscribe to capture and station events
    pub fn subscribe(&self) -> broadcast::Receiver<RecorderEvent> {
        self.ctx.subscribe()
    }

    /// Validate the host (once) and spawn a supervisor for every active
    /// station that does not already have a running one. Returns how many
    /// supervisors were spawned.
    pub async fn start_all(&self) -> RecorderResult<usize> {
        if !self.state.read().validated {
            let report = self.preflight.run().await;
            report.log();

            let passed = report.passed;
            let errors = report.errors.clone();
            {
                let mut state = self.state.write();
                state.validated = passed;
                state.report = Some(report);
            }
            if !passed {
                return Err(RecorderError::Preflight(errors));
            }
        }

        self.ctx.registry.reopen();
        let stations = self.ctx.stations.list_active_stations().await?;

        let mut spawned = 0;
        {
            let mut tasks = self.tasks.lock();
            tasks.retain(|_, task| !task.handle.is_finished());

            for station in &stations {
                if tasks.contains_key(&station.id) {
                    tracing::debug!("Supervisor for {} already running", station.id);
                    continue;
                }

                self.exits.lock().remove(&station.id);
                let token = CancellationToken::new();
                let supervisor = StationSupervisor::new(self.ctx.clone(), station, token.clone());
                let exits = self.exits.clone();
                let station_id = station.id.clone();
                let handle = tokio::spawn(async move {
                    let exit = supervisor.run().await;
                    exits.lock().insert(station_id, exit.clone());
                    exit
                });

                tasks.insert(
                    station.id.clone(),
                    StationTask {
                        name: station.name.clone(),
                        token,
                        handle,
                    },
                );
                spawned += 1;
            }
        }

        {
            let mut state = self.state.write();
            if state.started_at.is_none() {
                state.started_at = Some(Utc::now());
            }
        }
        self.start_janitor();

        tracing::info!(
            "Recording orchestrator running: {} station(s), {} new supervisor(s)",
            stations.len(),
            spawned
        );
        Ok(spawned)
    }

    /// Finalize every capture and stop every station loop. Safe to call
    /// more than once.
    pub async fn stop_all(&self) -> ShutdownSummary {
        let timeout = self.ctx.settings.shutdown_timeout;
        // A capture a station loop already claimed finishes on that loop's
        // schedule, so the drain waits as long as a finalization may take.
        let drain_timeout = self.ctx.settings.finalize_budget() + timeout;
        let mut summary = ShutdownSummary::default();

        self.ctx.registry.close();

        let keys = self.ctx.registry.keys();
        if !keys.is_empty() {
            tracing::info!("Finalizing {} active capture(s)", keys.len());
        }
        let mut stops = JoinSet::new();
        for key in keys {
            let ctx = self.ctx.clone();
            stops.spawn(async move { stop_capture(&ctx, &key).await });
        }
        while let Some(result) = stops.join_next().await {
            match result {
                Ok(Some(_)) => summary.finalized += 1,
                Ok(None) => {}
                Err(e) => tracing::error!("Capture shutdown task panicked: {}", e),
            }
        }

        // Captures a station loop is finalizing itself
        let registry = self.ctx.registry.clone();
        if !poll_until(drain_timeout, SHUTDOWN_POLL_INTERVAL, || registry.is_empty()).await {
            tracing::warn!(
                "{} capture(s) still finalizing after {:?}",
                registry.len(),
                drain_timeout
            );
        }

        let tasks: Vec<(String, StationTask)> = self.tasks.lock().drain().collect();
        for (_, task) in &tasks {
            task.token.cancel();
        }
        for (station_id, task) in tasks {
            summary.station_tasks += 1;
            match tokio::time::timeout(drain_timeout, task.handle).await {
                Ok(Ok(exit)) => tracing::debug!("Supervisor for {} stopped: {:?}", station_id, exit),
                Ok(Err(e)) => tracing::error!("Supervisor for {} panicked: {}", station_id, e),
                Err(_) => {
                    summary.timed_out += 1;
                    tracing::warn!(
                        "Supervisor for {} ({}) did not stop within {:?}, detaching",
                        station_id,
                        task.name,
                        drain_timeout
                    );
                }
            }
        }

        self.stop_janitor().await;

        let leftovers = self.ctx.registry.clear_unclaimed();
        if !leftovers.is_empty() {
            summary.timed_out += leftovers.len();
            tracing::warn!("Dropping {} unclaimed capture(s): {:?}", leftovers.len(), leftovers);
        }
        let finalizing = self.ctx.registry.finalizing_keys();
        if !finalizing.is_empty() {
            summary.timed_out += finalizing.len();
            tracing::error!(
                "{} capture(s) still finalizing after {:?} and may remain 'recording': {:?}",
                finalizing.len(),
                drain_timeout,
                finalizing
            );
        }

        self.state.write().started_at = None;
        tracing::info!(
            "Recording orchestrator stopped: {} finalized, {} supervisor(s), {} timed out",
            summary.finalized,
            summary.station_tasks,
            summary.timed_out
        );
        summary
    }

    /// Stop everything; alias for [`Orchestrator::stop_all`]
    pub async fn close(&self) -> ShutdownSummary {
        self.stop_all().await
    }

    pub fn status(&self) -> OrchestratorStatus {
        let state = self.state.read();
        let captures = self.ctx.registry.snapshot();
        let exits = self.exits.lock().clone();

        let mut stations = BTreeMap::new();
        for (station_id, task) in self.tasks.lock().iter() {
            stations.insert(
                station_id.clone(),
                StationStatus {
                    name: task.name.clone(),
                    task_running: !task.handle.is_finished(),
                    active_recordings: captures.iter().filter(|c| &c.station_id == station_id).count(),
                    last_exit: exits.get(station_id).cloned(),
                },
            );
        }

        let settings = &self.ctx.settings;
        OrchestratorStatus {
            validated: state.validated,
            running: state.started_at.is_some(),
            started_at: state.started_at,
            uptime_seconds: uptime(state.started_at),
            stations,
            active_recordings: captures.into_iter().map(|c| (c.key.clone(), c)).collect(),
            preflight: state.report.clone(),
            settings: SettingsSummary {
                check_interval_secs: settings.check_interval.as_secs_f64(),
                cleanup_timeout_secs: settings.cleanup_timeout.as_secs_f64(),
                file_ops: settings.file_ops,
                timezone: settings.timezone.to_string(),
                recording_dir: settings.recording_dir.display().to_string(),
            },
        }
    }

    pub fn health_check(&self) -> HealthReport {
        let (validated, started_at) = {
            let state = self.state.read();
            (state.validated, state.started_at)
        };
        let (total_stations, running_stations) = {
            let tasks = self.tasks.lock();
            let running = tasks.values().filter(|t| !t.handle.is_finished()).count();
            (tasks.len(), running)
        };
        let dead_station_tasks = total_stations - running_stations;
        let zombie_processes = self.ctx.registry.zombie_count();

        HealthReport {
            healthy: total_stations > 0 && dead_station_tasks == 0 && zombie_processes == 0 && validated,
            total_stations,
            running_stations,
            dead_station_tasks,
            active_recordings: self.ctx.registry.len(),
            zombie_processes,
            validated,
            uptime_seconds: uptime(started_at),
        }
    }

    /// Remove stale capture files now, regardless of the periodic setting
    pub async fn cleanup_orphaned_files(&self, max_age: Duration) -> RecorderResult<usize> {
        Ok(janitor::sweep(&self.ctx, max_age).await?)
    }

    fn start_janitor(&self) {
        let Some(cleanup) = self.ctx.settings.orphan_cleanup else {
            return;
        };
        let mut janitor = self.janitor.lock();
        if janitor.as_ref().is_some_and(|bg| !bg.handle.is_finished()) {
            return;
        }

        let token = CancellationToken::new();
        let handle = tokio::spawn(janitor::run(self.ctx.clone(), cleanup, token.clone()));
        *janitor = Some(Background { token, handle });
    }

    async fn stop_janitor(&self) {
        let Some(background) = self.janitor.lock().take() else {
            return;
        };
        background.token.cancel();
        if let Err(e) = background.handle.await {
            tracing::warn!("Orphan cleanup task ended abnormally: {}", e);
        }
    }
}

fn uptime(started_at: Option<DateTime<Utc>>) -> Option<i64> {
    started_at.map(|at| (Utc::now() - at).num_seconds())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recorder::registry::ActiveCapture;
    use crate::recorder::state::RecordingStatus;
    use crate::recorder::testing::{fast_settings, FakeProcess, Harness};

    fn orchestrator(harness: &Harness) -> Orchestrator {
        Orchestrator::new(fast_settings(harness.dir.path()), harness.collaborators.clone())
    }

    async fn wait_for<F: Fn() -> bool>(condition: F) {
        assert!(
            poll_until(Duration::from_secs(5), Duration::from_millis(10), condition).await,
            "condition not met in time"
        );
    }

    #[tokio::test]
    async fn test_shutdown_finalizes_before_station_exit() {
        let harness = Harness::new();
        harness.add_live_station();
        let orchestrator = orchestrator(&harness);
        let mut events = orchestrator.subscribe();

        assert_eq!(orchestrator.start_all().await.unwrap(), 1);
        let registry = orchestrator.context().registry.clone();
        wait_for(|| !registry.is_empty()).await;

        let summary = orchestrator.stop_all().await;

        assert_eq!(summary.finalized, 1);
        assert_eq!(summary.station_tasks, 1);
        assert_eq!(summary.timed_out, 0);
        assert!(registry.is_empty());

        let mut finalized_at = None;
        let mut exited_at = None;
        let mut index = 0;
        while let Ok(event) = events.try_recv() {
            match event {
                RecorderEvent::CaptureFinalized { status, .. } => {
                    assert_eq!(status, RecordingStatus::Completed);
                    finalized_at = Some(index);
                }
                RecorderEvent::StationExited { exit, .. } => {
                    assert_eq!(exit, StationExit::Cancelled);
                    exited_at = Some(index);
                }
                _ => {}
            }
            index += 1;
        }
        assert!(finalized_at.unwrap() < exited_at.unwrap());

        let records = harness.records.all();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].recording_status, RecordingStatus::Completed);
        assert_eq!(harness.blobs.saved().len(), 1);
    }

    #[tokio::test]
    async fn test_preflight_failure_aborts_start() {
        let harness = Harness::with_preflight(vec!["FFmpeg not found".to_string()]);
        harness.add_live_station();
        let orchestrator = orchestrator(&harness);

        let err = orchestrator.start_all().await.unwrap_err();

        assert!(matches!(err, RecorderError::Preflight(ref errors) if errors.len() == 1));
        let status = orchestrator.status();
        assert!(!status.validated);
        assert!(status.stations.is_empty());
        assert!(!status.preflight.unwrap().passed);
        assert_eq!(harness.spawner.spawn_count(), 0);
    }

    #[tokio::test]
    async fn test_start_and_stop_are_idempotent() {
        let harness = Harness::new();
        harness.add_live_station();
        let orchestrator = orchestrator(&harness);

        assert_eq!(orchestrator.start_all().await.unwrap(), 1);
        assert_eq!(orchestrator.start_all().await.unwrap(), 0);

        orchestrator.stop_all().await;
        let second = orchestrator.stop_all().await;
        assert_eq!(second, ShutdownSummary::default());
        assert!(!orchestrator.status().running);

        // Restart after a full stop
        assert_eq!(orchestrator.start_all().await.unwrap(), 1);
        orchestrator.close().await;
    }

    #[tokio::test]
    async fn test_health_check() {
        let harness = Harness::new();
        let orchestrator = orchestrator(&harness);

        // No stations is not healthy
        let health = orchestrator.health_check();
        assert!(!health.healthy);
        assert_eq!(health.total_stations, 0);

        harness.add_live_station();
        orchestrator.start_all().await.unwrap();
        let registry = orchestrator.context().registry.clone();
        wait_for(|| !registry.is_empty()).await;

        let health = orchestrator.health_check();
        assert!(health.healthy);
        assert_eq!(health.running_stations, 1);
        assert_eq!(health.active_recordings, 1);
        assert_eq!(health.zombie_processes, 0);
        assert!(health.uptime_seconds.is_some());

        orchestrator.stop_all().await;
    }

    #[tokio::test]
    async fn test_zombie_capture_makes_unhealthy() {
        let harness = Harness::new();
        let station = harness.station();
        harness.catalog.add(station, Default::default());
        let orchestrator = orchestrator(&harness);
        orchestrator.start_all().await.unwrap();

        let dead = harness.recording_capture(FakeProcess::exited("eof"), None).await;
        orchestrator.context().registry.insert(dead).unwrap();

        let health = orchestrator.health_check();
        assert_eq!(health.zombie_processes, 1);
        assert!(!health.healthy);

        orchestrator.stop_all().await;
    }

    #[tokio::test]
    async fn test_stop_all_waits_for_capture_claimed_by_station() {
        let harness = Harness::new();
        let station = harness.station();
        harness.catalog.add(station, Default::default());

        // Shutdown timeout far shorter than a stubborn capture takes to stop
        let mut settings = fast_settings(harness.dir.path());
        settings.shutdown_timeout = Duration::from_millis(50);
        settings.cleanup_timeout = Duration::from_millis(600);
        let orchestrator = Orchestrator::new(settings, harness.collaborators.clone());

        let capture = harness
            .recording_capture(FakeProcess::stubborn(), Some(b"mp3 data"))
            .await;
        let mut session = capture.session.clone();
        session.ends_at = (Utc::now() - chrono::Duration::seconds(1)).fixed_offset();
        let capture = ActiveCapture { session, ..capture };
        let recording_id = capture.recording_id.clone();
        let registry = orchestrator.context().registry.clone();
        registry.insert(capture).unwrap();

        orchestrator.start_all().await.unwrap();
        // The station loop notices the ended session and starts stopping it
        wait_for(|| !registry.finalizing_keys().is_empty()).await;

        let summary = orchestrator.stop_all().await;

        assert_eq!(summary.timed_out, 0);
        assert!(registry.is_empty());
        let record = harness.record(&recording_id);
        assert_eq!(record.recording_status, RecordingStatus::Completed);
    }

    #[tokio::test]
    async fn test_restart_clears_previous_exit() {
        let harness = Harness::new();
        let station = harness.add_live_station();
        let orchestrator = orchestrator(&harness);
        orchestrator.start_all().await.unwrap();

        harness.catalog.set_active(&station.id, false);
        wait_for(|| orchestrator.health_check().dead_station_tasks == 1).await;
        assert_eq!(
            orchestrator.status().stations[&station.id].last_exit,
            Some(StationExit::Inactive)
        );

        harness.catalog.set_active(&station.id, true);
        assert_eq!(orchestrator.start_all().await.unwrap(), 1);

        let status = orchestrator.status();
        assert_eq!(status.stations[&station.id].last_exit, None);

        orchestrator.stop_all().await;
    }

    #[tokio::test]
    async fn test_status_reports_station_exit() {
        let harness = Harness::new();
        let station = harness.add_live_station();
        let orchestrator = orchestrator(&harness);
        orchestrator.start_all().await.unwrap();

        harness.catalog.set_active(&station.id, false);
        let exits = orchestrator.exits.clone();
        wait_for(|| exits.lock().contains_key(&station.id)).await;

        let status = orchestrator.status();
        let station_status = &status.stations[&station.id];
        assert_eq!(station_status.last_exit, Some(StationExit::Inactive));
        assert!(status.active_recordings.is_empty());

        orchestrator.stop_all().await;
    }
}
