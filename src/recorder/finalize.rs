//! Capture finalization
//!
//! Turns a stopped capture into a terminal record: the local file is read,
//! uploaded to the blob store and only then deleted. Any failure marks the
//! record `failed` and leaves the local file in place for manual recovery.

use super::context::RecorderContext;
use super::registry::ActiveCapture;
use super::state::{duration_minutes, size_mb, RecordingStatus, RecordingUpdate};
use crate::store::{StoreError, StoredBlob};
use crate::utils::file_ops::{path_exists, FileOpError};
use crate::utils::{RecorderError, RecorderResult};
use chrono::Utc;

/// Bring the record of `capture` to `completed` or `failed`. The capture
/// process must already have exited.
///
/// A record that is already terminal is left untouched.
pub async fn finalize(ctx: &RecorderContext, capture: &ActiveCapture) -> RecorderResult<RecordingStatus> {
    let record = ctx
        .records
        .get(&capture.recording_id)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("recording {}", capture.recording_id)))?;

    if record.recording_status.is_terminal() {
        tracing::warn!(
            "Recording {} for {} is already {}, skipping finalization",
            capture.recording_id,
            capture.key,
            record.recording_status
        );
        return Ok(record.recording_status);
    }

    let started_at = record.actual_start_time.unwrap_or(capture.started_at);
    let outcome = persist(ctx, capture).await;
    let ended_at = Utc::now();

    match outcome {
        Ok((stored, bytes)) => {
            let duration = duration_minutes(started_at, ended_at);
            let update = RecordingUpdate {
                status: Some(RecordingStatus::Completed),
                actual_end_time: Some(ended_at),
                duration_minutes: Some(duration),
                file_path: Some(stored.path.clone()),
                file_url: Some(stored.url.clone()),
                file_size_mb: Some(size_mb(bytes)),
                recording_process_id: Some(None),
                error_message: Some(None),
                ..Default::default()
            };
            ctx.records.update(&capture.recording_id, update).await?;

            tracing::info!(
                "Recording {} for {} completed: {} ({} MB, {} min)",
                capture.recording_id,
                capture.key,
                stored.url,
                size_mb(bytes),
                duration
            );

            // The upload is what counts; a leftover temp file is only noise
            if let Err(e) = ctx.files.safe_delete(&capture.file_path).await {
                tracing::warn!(
                    "Uploaded {} but could not remove temp file {:?}: {}",
                    capture.key,
                    capture.file_path,
                    e
                );
            }

            Ok(RecordingStatus::Completed)
        }
        Err(err) => {
            let message = failure_message(&err);
            ctx.records
                .update(
                    &capture.recording_id,
                    RecordingUpdate::failed(started_at, ended_at, message.clone()),
                )
                .await?;

            tracing::warn!(
                "Recording {} for {} failed: {}",
                capture.recording_id,
                capture.key,
                message
            );
            if path_exists(&capture.file_path).await {
                tracing::info!("Keeping {:?} for manual recovery", capture.file_path);
            }

            Ok(RecordingStatus::Failed)
        }
    }
}

/// Read and upload the capture file
async fn persist(ctx: &RecorderContext, capture: &ActiveCapture) -> RecorderResult<(StoredBlob, u64)> {
    let bytes = ctx.files.safe_read(&capture.file_path).await?;
    let size = bytes.len() as u64;

    let file_name = capture
        .file_path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| format!("{}.{}", capture.key, ctx.settings.format.extension()));

    let upload_timeout = ctx.settings.upload_timeout;
    match tokio::time::timeout(upload_timeout, ctx.blobs.save(bytes, &file_name)).await {
        Ok(Ok(stored)) => Ok((stored, size)),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(RecorderError::Timeout(format!("{:?}", upload_timeout))),
    }
}

/// Message stored on the record when persisting fails
fn failure_message(err: &RecorderError) -> String {
    match err {
        RecorderError::File(FileOpError::NotFound(_)) => "Recording file not found".to_string(),
        RecorderError::File(FileOpError::Empty(_)) => "Recording file is empty (0 bytes)".to_string(),
        RecorderError::File(e) => format!("File read error: {}", e),
        RecorderError::Store(e) => format!("File upload error: {}", e),
        RecorderError::Timeout(after) => format!("File upload timed out after {}", after),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recorder::testing::{Harness, FakeProcess};

    #[tokio::test]
    async fn test_completed_capture_is_uploaded_and_removed() {
        let harness = Harness::new();
        let capture = harness.recording_capture(FakeProcess::exited(""), Some(b"mp3 data")).await;

        let status = finalize(&harness.ctx, &capture).await.unwrap();

        assert_eq!(status, RecordingStatus::Completed);
        let record = harness.record(&capture.recording_id);
        assert_eq!(record.recording_status, RecordingStatus::Completed);
        assert!(record.file_url.as_deref().unwrap().starts_with("memory://"));
        assert!(record.error_message.is_none());
        assert!(record.duration_minutes.is_some());
        assert_eq!(harness.blobs.saved().len(), 1);
        assert!(!capture.file_path.exists());
    }

    #[tokio::test]
    async fn test_missing_file_fails() {
        let harness = Harness::new();
        let capture = harness.recording_capture(FakeProcess::exited(""), None).await;

        let status = finalize(&harness.ctx, &capture).await.unwrap();

        assert_eq!(status, RecordingStatus::Failed);
        let record = harness.record(&capture.recording_id);
        assert_eq!(record.error_message.as_deref(), Some("Recording file not found"));
        assert!(record.actual_end_time.is_some());
        assert!(harness.blobs.saved().is_empty());
    }

    #[tokio::test]
    async fn test_empty_file_fails_and_is_kept() {
        let harness = Harness::new();
        let capture = harness.recording_capture(FakeProcess::exited(""), Some(b"")).await;

        finalize(&harness.ctx, &capture).await.unwrap();

        let record = harness.record(&capture.recording_id);
        assert_eq!(record.recording_status, RecordingStatus::Failed);
        assert_eq!(
            record.error_message.as_deref(),
            Some("Recording file is empty (0 bytes)")
        );
        assert!(capture.file_path.exists());
    }

    #[tokio::test]
    async fn test_upload_failure_keeps_temp_file() {
        let harness = Harness::new();
        harness.blobs.fail_with("bucket offline");
        let capture = harness.recording_capture(FakeProcess::exited(""), Some(b"mp3 data")).await;

        let status = finalize(&harness.ctx, &capture).await.unwrap();

        assert_eq!(status, RecordingStatus::Failed);
        let record = harness.record(&capture.recording_id);
        assert!(record
            .error_message
            .as_deref()
            .unwrap()
            .contains("bucket offline"));
        assert!(record.file_url.is_none());
        assert!(capture.file_path.exists());
    }

    #[test]
    fn test_failure_messages() {
        let missing = RecorderError::File(FileOpError::NotFound("a.mp3".into()));
        assert_eq!(failure_message(&missing), "Recording file not found");

        let timeout = RecorderError::Timeout("2s".to_string());
        assert_eq!(failure_message(&timeout), "File upload timed out after 2s");
        assert_eq!(timeout.code(), "TIMEOUT");

        let upload = RecorderError::from(StoreError::Unavailable("bucket offline".to_string()));
        assert_eq!(failure_message(&upload), "File upload error: unavailable: bucket offline");
    }

    #[tokio::test]
    async fn test_terminal_record_is_not_finalized_twice() {
        let harness = Harness::new();
        let capture = harness.recording_capture(FakeProcess::exited(""), Some(b"mp3 data")).await;

        assert_eq!(
            finalize(&harness.ctx, &capture).await.unwrap(),
            RecordingStatus::Completed
        );
        assert_eq!(
            finalize(&harness.ctx, &capture).await.unwrap(),
            RecordingStatus::Completed
        );
        assert_eq!(harness.blobs.saved().len(), 1);
    }
}
