//! Start and stop actions
//!
//! `start_capture` creates the record, launches FFmpeg and registers the
//! capture once it survives the liveness probe. `stop_capture` terminates
//! the process (forcefully if it will not exit) and always finalizes.

use super::command::{capture_file_name, CaptureRequest};
use super::context::{RecorderContext, RecorderEvent};
use super::finalize::finalize;
use super::process::{ProcessError, ProcessHandle};
use super::registry::{ActiveCapture, RegisterError};
use super::state::{RecordingRecord, RecordingStatus, RecordingUpdate};
use crate::schedule::{ActiveSession, RecordingKey, Station};
use crate::utils::{RecorderError, RecorderResult};
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Result of a start attempt
#[derive(Debug, Clone, PartialEq)]
pub enum StartOutcome {
    /// Capture is running and registered
    Started(RecordingKey),
    /// Capture could not be started; the record is `failed`
    Failed {
        key: RecordingKey,
        recording_id: String,
        error: String,
    },
    /// Nothing was started (already active, or shutting down)
    Skipped,
}

/// Start capturing `active` for `station`
pub async fn start_capture(
    ctx: &RecorderContext,
    station: &Station,
    active: &ActiveSession,
) -> RecorderResult<StartOutcome> {
    let key = active.key(&station.id);
    if !ctx.registry.is_open() || ctx.registry.contains(&key) {
        return Ok(StartOutcome::Skipped);
    }

    let settings = &ctx.settings;
    let program_title = match &active.session.program_id {
        Some(program_id) => ctx
            .schedules
            .program_title(program_id)
            .await
            .unwrap_or_else(|e| {
                tracing::warn!("Could not look up program {}: {}", program_id, e);
                None
            }),
        None => None,
    };

    let started_at = Utc::now();
    let suffix = Uuid::new_v4().simple().to_string()[..8].to_string();
    let file_name = capture_file_name(
        &station.name,
        program_title.as_deref(),
        active,
        started_at.with_timezone(&active.starts_at.timezone()),
        &suffix,
        settings.format,
    );
    tokio::fs::create_dir_all(&settings.recording_dir).await?;
    let file_path = settings.recording_dir.join(file_name);

    let mut record = RecordingRecord::scheduled(station, active, settings.format, settings.quality);
    record
        .apply(RecordingUpdate {
            status: Some(RecordingStatus::Recording),
            actual_start_time: Some(started_at),
            file_path: Some(file_path.display().to_string()),
            ..Default::default()
        })
        .map_err(crate::store::StoreError::from)?;
    let recording_id = ctx.records.create(record).await?;

    tracing::info!(
        "Starting capture {} ({}) for station {} to {:?}",
        key,
        recording_id,
        station.name,
        file_path
    );

    let request = CaptureRequest {
        label: key.to_string(),
        stream_url: station.stream_url.clone(),
        output_path: file_path.clone(),
        format: settings.format,
        quality: settings.quality,
    };

    let process = match ctx.spawner.spawn(&request) {
        Ok(process) => process,
        Err(e) => return Ok(abandon(ctx, key, recording_id, started_at, e.into()).await),
    };

    if let Err(e) = ctx
        .records
        .update(
            &recording_id,
            RecordingUpdate {
                recording_process_id: Some(process.pid()),
                ..Default::default()
            },
        )
        .await
    {
        tracing::warn!("Could not store pid for {}: {}", key, e);
    }

    tokio::time::sleep(settings.liveness_probe).await;

    if !process.is_running() {
        let error = ProcessError::EarlyExit(process.diagnostics());
        return Ok(abandon(ctx, key, recording_id, started_at, error.into()).await);
    }

    let capture = ActiveCapture {
        key: key.clone(),
        recording_id: recording_id.clone(),
        file_path,
        started_at,
        session: active.clone(),
        process,
    };

    if let Err((reason, capture)) = ctx.registry.insert(capture) {
        // Shutdown began while the process was starting
        tracing::warn!("Capture {} started but could not be registered: {:?}", key, reason);
        let status = halt_and_finalize(ctx, &capture).await;
        ctx.emit(RecorderEvent::CaptureFinalized {
            key: key.clone(),
            recording_id: recording_id.clone(),
            status,
        });
        return Ok(StartOutcome::Failed {
            key,
            recording_id,
            error: match reason {
                RegisterError::Closed => "Recorder shutting down".to_string(),
                RegisterError::Duplicate => "Duplicate capture".to_string(),
            },
        });
    }

    tracing::info!("Capture {} running", key);
    ctx.emit(RecorderEvent::CaptureStarted {
        key: key.clone(),
        recording_id,
    });
    Ok(StartOutcome::Started(key))
}

/// Mark a capture that never got registered as failed
async fn abandon(
    ctx: &RecorderContext,
    key: RecordingKey,
    recording_id: String,
    started_at: DateTime<Utc>,
    err: RecorderError,
) -> StartOutcome {
    let error = start_failure_message(&err);
    tracing::error!("Capture {} failed to start [{}]: {}", key, err.code(), error);
    if let Err(e) = ctx
        .records
        .update(&recording_id, RecordingUpdate::failed(started_at, Utc::now(), error.clone()))
        .await
    {
        tracing::error!("Could not mark recording {} as failed: {}", recording_id, e);
    }

    ctx.emit(RecorderEvent::CaptureFailed {
        key: key.clone(),
        recording_id: Some(recording_id.clone()),
        error: error.clone(),
    });
    StartOutcome::Failed {
        key,
        recording_id,
        error,
    }
}

/// Message stored on the record of a capture that never got going
fn start_failure_message(err: &RecorderError) -> String {
    match err {
        RecorderError::Process(ProcessError::EarlyExit(output)) if output.is_empty() => {
            "Capture process exited during startup".to_string()
        }
        RecorderError::Process(ProcessError::EarlyExit(output)) => {
            format!("Capture process exited during startup: {}", output)
        }
        RecorderError::Process(e) => format!("Failed to start capture process: {}", e),
        other => other.to_string(),
    }
}

/// Stop the capture registered under `key` and finalize it.
///
/// Returns `None` when there is nothing to stop: the key is unknown, was
/// already finalized, or is being finalized by another caller.
pub async fn stop_capture(ctx: &RecorderContext, key: &RecordingKey) -> Option<RecordingStatus> {
    let Some(capture) = ctx.registry.claim(key) else {
        tracing::debug!("No active capture for {}, nothing to stop", key);
        return None;
    };

    tracing::info!("Stopping capture {} ({})", key, capture.recording_id);
    let status = halt_and_finalize(ctx, &capture).await;

    // Removed only now, so a crash mid-finalization leaves the entry behind
    ctx.registry.release(key);
    ctx.emit(RecorderEvent::CaptureFinalized {
        key: key.clone(),
        recording_id: capture.recording_id.clone(),
        status,
    });
    Some(status)
}

async fn halt_and_finalize(ctx: &RecorderContext, capture: &ActiveCapture) -> RecordingStatus {
    halt(ctx, capture.process.as_ref(), &capture.key).await;

    match finalize(ctx, capture).await {
        Ok(status) => status,
        Err(e) => {
            tracing::error!("Finalization of {} failed: {}", capture.key, e);
            let update = RecordingUpdate::failed(
                capture.started_at,
                Utc::now(),
                format!("Finalization error: {}", e),
            );
            if let Err(e) = ctx.records.update(&capture.recording_id, update).await {
                tracing::error!(
                    "Recording {} could not be marked failed and may still read 'recording': {}",
                    capture.recording_id,
                    e
                );
            }
            RecordingStatus::Failed
        }
    }
}

/// Terminate, wait for the cleanup timeout, then force kill
async fn halt(ctx: &RecorderContext, process: &dyn ProcessHandle, key: &RecordingKey) {
    let settings = &ctx.settings;

    let exited = match process.terminate() {
        Ok(()) => process.wait(settings.cleanup_timeout).await,
        Err(e) => {
            tracing::warn!("Graceful termination of {} failed: {}", key, e);
            false
        }
    };

    if exited {
        tracing::debug!("Capture process for {} exited", key);
    } else {
        tracing::warn!(
            "Capture process for {} still running after {:?}, force killing",
            key,
            settings.cleanup_timeout
        );
        if let Err(e) = process.force_kill() {
            tracing::error!("Force kill of {} failed: {}", key, e);
        }
        if !process.wait(settings.force_kill_grace).await {
            tracing::error!(
                "Capture process for {} (pid {:?}) survived force kill",
                key,
                process.pid()
            );
        }
    }

    if !settings.handle_release_delay.is_zero() {
        tokio::time::sleep(settings.handle_release_delay).await;
    }
}
