//! Active capture registry
//!
//! Maps each [`RecordingKey`] to its live capture. Keys are namespaced by
//! station and every station has a single supervisor, so entries are only
//! ever written by their owner; the lock exists for status readers.
//!
//! An entry stays in the table until finalization completes. `claim` marks
//! it as finalizing so a second stop of the same key is a no-op.

use super::process::ProcessHandle;
use crate::schedule::{ActiveSession, RecordingKey};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

/// One running capture
#[derive(Debug, Clone)]
pub struct ActiveCapture {
    pub key: RecordingKey,

    pub recording_id: String,

    pub file_path: PathBuf,

    pub started_at: DateTime<Utc>,

    pub session: ActiveSession,

    pub process: Arc<dyn ProcessHandle>,
}

/// Serializable view of an [`ActiveCapture`]
#[derive(Debug, Clone, Serialize)]
pub struct CaptureStatus {
    pub key: String,
    pub station_id: String,
    pub recording_id: String,
    pub file_path: String,
    pub started_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub program_id: Option<String>,
    pub pid: Option<u32>,
    pub process_running: bool,
    pub finalizing: bool,
}

#[derive(Debug)]
struct Entry {
    capture: ActiveCapture,
    finalizing: bool,
}

#[derive(Debug)]
struct Inner {
    captures: HashMap<RecordingKey, Entry>,
    open: bool,
}

/// Why a capture could not be registered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterError {
    /// A capture with the same key is already registered
    Duplicate,
    /// The registry stopped accepting captures (shutdown)
    Closed,
}

/// Shared table of active captures
#[derive(Debug, Clone)]
pub struct CaptureRegistry {
    inner: Arc<RwLock<Inner>>,
}

impl Default for CaptureRegistry {
    fn default() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner {
                captures: HashMap::new(),
                open: true,
            })),
        }
    }
}

impl CaptureRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a capture; at most one per key
    pub fn insert(&self, capture: ActiveCapture) -> Result<(), (RegisterError, ActiveCapture)> {
        let mut inner = self.inner.write();
        if !inner.open {
            return Err((RegisterError::Closed, capture));
        }
        if inner.captures.contains_key(&capture.key) {
            return Err((RegisterError::Duplicate, capture));
        }
        inner.captures.insert(
            capture.key.clone(),
            Entry {
                capture,
                finalizing: false,
            },
        );
        Ok(())
    }

    /// Take responsibility for stopping `key`. Returns `None` if the key is
    /// unknown or already being finalized.
    pub fn claim(&self, key: &RecordingKey) -> Option<ActiveCapture> {
        let mut inner = self.inner.write();
        let entry = inner.captures.get_mut(key)?;
        if entry.finalizing {
            return None;
        }
        entry.finalizing = true;
        Some(entry.capture.clone())
    }

    /// Drop `key` after finalization
    pub fn release(&self, key: &RecordingKey) -> Option<ActiveCapture> {
        self.inner.write().captures.remove(key).map(|entry| entry.capture)
    }

    pub fn contains(&self, key: &RecordingKey) -> bool {
        self.inner.read().captures.contains_key(key)
    }

    pub fn keys(&self) -> Vec<RecordingKey> {
        self.inner.read().captures.keys().cloned().collect()
    }

    /// Captures owned by `station_id` that are not being finalized
    pub fn for_station(&self, station_id: &str) -> Vec<ActiveCapture> {
        self.inner
            .read()
            .captures
            .values()
            .filter(|entry| !entry.finalizing && entry.capture.key.belongs_to(station_id))
            .map(|entry| entry.capture.clone())
            .collect()
    }

    pub fn keys_for_station(&self, station_id: &str) -> Vec<RecordingKey> {
        self.inner
            .read()
            .captures
            .keys()
            .filter(|key| key.belongs_to(station_id))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().captures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Captures whose process died while still registered
    pub fn zombie_count(&self) -> usize {
        self.inner
            .read()
            .captures
            .values()
            .filter(|entry| !entry.finalizing && !entry.capture.process.is_running())
            .count()
    }

    pub fn snapshot(&self) -> Vec<CaptureStatus> {
        let inner = self.inner.read();
        let mut captures: Vec<CaptureStatus> = inner
            .captures
            .values()
            .map(|entry| {
                let capture = &entry.capture;
                CaptureStatus {
                    key: capture.key.to_string(),
                    station_id: capture.key.station_id.clone(),
                    recording_id: capture.recording_id.clone(),
                    file_path: capture.file_path.display().to_string(),
                    started_at: capture.started_at,
                    ends_at: capture.session.ends_at.with_timezone(&Utc),
                    program_id: capture.session.session.program_id.clone(),
                    pid: capture.process.pid(),
                    process_running: capture.process.is_running(),
                    finalizing: entry.finalizing,
                }
            })
            .collect();
        captures.sort_by(|a, b| a.key.cmp(&b.key));
        captures
    }

    /// Stop accepting new captures
    pub fn close(&self) {
        self.inner.write().open = false;
    }

    pub fn reopen(&self) {
        self.inner.write().open = true;
    }

    pub fn is_open(&self) -> bool {
        self.inner.read().open
    }

    /// Forget entries nobody is finalizing, returning their keys. Claimed
    /// entries stay until their owner releases them.
    pub fn clear_unclaimed(&self) -> Vec<RecordingKey> {
        let mut inner = self.inner.write();
        let keys: Vec<RecordingKey> = inner
            .captures
            .iter()
            .filter(|(_, entry)| !entry.finalizing)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &keys {
            inner.captures.remove(key);
        }
        keys
    }

    /// Keys currently being finalized
    pub fn finalizing_keys(&self) -> Vec<RecordingKey> {
        let inner = self.inner.read();
        let mut keys: Vec<RecordingKey> = inner
            .captures
            .iter()
            .filter(|(_, entry)| entry.finalizing)
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort_by_key(|key| key.to_string());
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recorder::testing::{active_session, FakeProcess};

    fn capture(station: &str, start: &str) -> ActiveCapture {
        capture_with(station, start, FakeProcess::running())
    }

    fn capture_with(station: &str, start: &str, process: Arc<FakeProcess>) -> ActiveCapture {
        let session = active_session(start, "23:00");
        ActiveCapture {
            key: session.key(station),
            recording_id: format!("rec-{}", station),
            file_path: PathBuf::from("/tmp/capture.mp3"),
            started_at: Utc::now(),
            session,
            process,
        }
    }

    #[test]
    fn test_one_capture_per_key() {
        let registry = CaptureRegistry::new();
        registry.insert(capture("st1", "09:00")).unwrap();

        let (err, _) = registry.insert(capture("st1", "09:00")).unwrap_err();
        assert_eq!(err, RegisterError::Duplicate);

        registry.insert(capture("st2", "09:00")).unwrap();
        registry.insert(capture("st1", "10:00")).unwrap();
        assert_eq!(registry.len(), 3);
        assert_eq!(registry.keys_for_station("st1").len(), 2);
    }

    #[test]
    fn test_claim_is_exclusive_until_release() {
        let registry = CaptureRegistry::new();
        let capture = capture("st1", "09:00");
        let key = capture.key.clone();
        registry.insert(capture).unwrap();

        assert!(registry.claim(&key).is_some());
        assert!(registry.claim(&key).is_none());
        // Still visible while finalizing
        assert!(registry.contains(&key));
        assert!(registry.for_station("st1").is_empty());

        assert!(registry.release(&key).is_some());
        assert!(!registry.contains(&key));
        assert!(registry.claim(&key).is_none());
    }

    #[test]
    fn test_closed_registry_rejects_inserts() {
        let registry = CaptureRegistry::new();
        registry.close();

        let (err, _) = registry.insert(capture("st1", "09:00")).unwrap_err();
        assert_eq!(err, RegisterError::Closed);

        registry.reopen();
        assert!(registry.insert(capture("st1", "09:00")).is_ok());
    }

    #[test]
    fn test_clear_keeps_claimed_entries() {
        let registry = CaptureRegistry::new();
        let claimed = capture("st1", "09:00");
        let claimed_key = claimed.key.clone();
        registry.insert(claimed).unwrap();
        registry.insert(capture("st2", "09:00")).unwrap();
        registry.claim(&claimed_key).unwrap();

        let dropped = registry.clear_unclaimed();

        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].station_id, "st2");
        assert_eq!(registry.finalizing_keys(), vec![claimed_key.clone()]);
        assert!(registry.release(&claimed_key).is_some());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_zombie_count() {
        let registry = CaptureRegistry::new();
        registry
            .insert(capture_with("st1", "09:00", FakeProcess::exited("boom")))
            .unwrap();
        registry.insert(capture("st2", "09:00")).unwrap();

        assert_eq!(registry.zombie_count(), 1);
        assert_eq!(registry.snapshot().len(), 2);
    }
}
