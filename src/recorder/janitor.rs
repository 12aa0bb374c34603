//! Orphaned capture cleanup
//!
//! Capture files stay on disk when finalization fails. Once they are old
//! enough and no live capture refers to them, they are removed.

use super::context::{OrphanCleanup, RecorderContext};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};
use tokio_util::sync::CancellationToken;

/// Run cleanup every `cleanup.interval` until cancelled
pub async fn run(ctx: RecorderContext, cleanup: OrphanCleanup, token: CancellationToken) {
    tracing::info!(
        "Orphan cleanup every {:?} for files older than {:?}",
        cleanup.interval,
        cleanup.max_age
    );

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(cleanup.interval) => {}
        }

        match sweep(&ctx, cleanup.max_age).await {
            Ok(0) => {}
            Ok(removed) => tracing::info!("Removed {} orphaned capture file(s)", removed),
            Err(e) => tracing::warn!("Orphan cleanup failed: {}", e),
        }
    }

    tracing::debug!("Orphan cleanup stopped");
}

/// Delete capture files older than `max_age` that no active capture owns.
/// Returns how many were removed.
pub async fn sweep(ctx: &RecorderContext, max_age: Duration) -> std::io::Result<usize> {
    let dir = &ctx.settings.recording_dir;
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };

    let in_use: HashSet<PathBuf> = ctx
        .registry
        .snapshot()
        .into_iter()
        .map(|capture| PathBuf::from(capture.file_path))
        .collect();
    let extension = ctx.settings.format.extension();
    let now = SystemTime::now();
    let mut removed = 0;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some(extension) || in_use.contains(&path) {
            continue;
        }

        let metadata = entry.metadata().await?;
        if !metadata.is_file() {
            continue;
        }
        let age = metadata
            .modified()
            .ok()
            .and_then(|modified| now.duration_since(modified).ok())
            .unwrap_or_default();
        if age < max_age {
            continue;
        }

        match ctx.files.safe_delete(&path).await {
            Ok(()) => {
                tracing::info!("Removed orphaned capture {:?} ({:?} old)", path, age);
                removed += 1;
            }
            Err(e) => tracing::warn!("Could not remove orphaned capture {:?}: {}", path, e),
        }
    }

    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recorder::testing::{FakeProcess, Harness};

    #[tokio::test]
    async fn test_sweep_skips_active_and_foreign_files() {
        let harness = Harness::new();
        let capture = harness
            .recording_capture(FakeProcess::running(), Some(b"live"))
            .await;
        let live_path = capture.file_path.clone();
        harness.ctx.registry.insert(capture).unwrap();

        let dir = harness.ctx.settings.recording_dir.clone();
        std::fs::write(dir.join("stale.mp3"), b"old").unwrap();
        std::fs::write(dir.join("notes.txt"), b"keep").unwrap();

        let removed = sweep(&harness.ctx, Duration::ZERO).await.unwrap();

        assert_eq!(removed, 1);
        assert!(!dir.join("stale.mp3").exists());
        assert!(dir.join("notes.txt").exists());
        assert!(live_path.exists());
    }

    #[tokio::test]
    async fn test_sweep_keeps_recent_files() {
        let harness = Harness::new();
        let dir = harness.ctx.settings.recording_dir.clone();
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("fresh.mp3"), b"new").unwrap();

        let removed = sweep(&harness.ctx, Duration::from_secs(3600)).await.unwrap();

        assert_eq!(removed, 0);
        assert!(dir.join("fresh.mp3").exists());
    }

    #[tokio::test]
    async fn test_sweep_missing_dir() {
        let harness = Harness::new();
        assert_eq!(sweep(&harness.ctx, Duration::ZERO).await.unwrap(), 0);
    }
}
