//! Lock-aware file primitives
//!
//! A capture process that was just terminated may keep its output file open
//! for a short while (Windows releases handles lazily). Reads and deletes of
//! capture files therefore wait for the file to become unlocked and retry
//! the operation itself with the configured [`RetryPolicy`].

use super::retry::{retry_with_backoff, RetryPolicy};
use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// File primitive failures
#[derive(Error, Debug)]
pub enum FileOpError {
    #[error("file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("file is empty (0 bytes): {}", .0.display())]
    Empty(PathBuf),

    #[error("file still locked after {attempts} attempts: {}", .path.display())]
    Locked { path: PathBuf, attempts: u32 },

    #[error("{operation} failed after {attempts} attempts for {}: {source}", .path.display())]
    Io {
        operation: &'static str,
        path: PathBuf,
        attempts: u32,
        #[source]
        source: io::Error,
    },
}

/// Raw filesystem access, separated so lock behaviour can be simulated
#[async_trait]
pub trait FileAccess: Send + Sync {
    /// Whether another handle currently prevents exclusive access
    async fn is_locked(&self, path: &Path) -> bool;

    async fn read(&self, path: &Path) -> io::Result<Vec<u8>>;

    async fn remove(&self, path: &Path) -> io::Result<()>;
}

/// [`FileAccess`] backed by the real filesystem
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFileAccess;

#[async_trait]
impl FileAccess for LocalFileAccess {
    async fn is_locked(&self, path: &Path) -> bool {
        match tokio::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .await
        {
            Ok(_) => false,
            // A missing file cannot be locked; existence is checked separately
            Err(e) if e.kind() == io::ErrorKind::NotFound => false,
            Err(e) => {
                tracing::debug!("{:?} appears locked: {}", path, e);
                true
            }
        }
    }

    async fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        tokio::fs::read(path).await
    }

    async fn remove(&self, path: &Path) -> io::Result<()> {
        tokio::fs::remove_file(path).await
    }
}

/// Read/delete with unlock waits and bounded retries
#[derive(Clone)]
pub struct RetryingFileOps {
    access: Arc<dyn FileAccess>,
    policy: RetryPolicy,
}

impl RetryingFileOps {
    pub fn new(access: Arc<dyn FileAccess>, policy: RetryPolicy) -> Self {
        Self { access, policy }
    }

    /// File operations on the local filesystem
    pub fn local(policy: RetryPolicy) -> Self {
        Self::new(Arc::new(LocalFileAccess), policy)
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub async fn is_locked(&self, path: &Path) -> bool {
        self.access.is_locked(path).await
    }

    /// Wait for `path` to become unlocked using this instance's policy
    pub async fn wait_until_unlocked(&self, path: &Path) -> bool {
        self.wait_until_unlocked_with(path, &self.policy).await
    }

    /// Wait for `path` to become unlocked. Returns false if it is still
    /// locked after `policy.max_attempts` checks.
    pub async fn wait_until_unlocked_with(&self, path: &Path, policy: &RetryPolicy) -> bool {
        let result = retry_with_backoff(policy, |_| true, |attempt| async move {
            if self.access.is_locked(path).await {
                Err(format!("{:?} locked (check {})", path, attempt + 1))
            } else {
                Ok(())
            }
        })
        .await;

        match result {
            Ok(()) => true,
            Err(_) => {
                tracing::warn!(
                    "{:?} still locked after {} checks",
                    path,
                    policy.max_attempts
                );
                false
            }
        }
    }

    /// Read the whole file once it exists, is non-empty and is unlocked
    pub async fn safe_read(&self, path: &Path) -> Result<Vec<u8>, FileOpError> {
        let metadata = match tokio::fs::metadata(path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(FileOpError::NotFound(path.to_path_buf()));
            }
            Err(e) => {
                return Err(FileOpError::Io {
                    operation: "stat",
                    path: path.to_path_buf(),
                    attempts: 1,
                    source: e,
                });
            }
        };

        if metadata.len() == 0 {
            return Err(FileOpError::Empty(path.to_path_buf()));
        }

        if !self.wait_until_unlocked(path).await {
            return Err(FileOpError::Locked {
                path: path.to_path_buf(),
                attempts: self.policy.max_attempts,
            });
        }

        // The handle can be re-taken between the check and the open
        let bytes = retry_with_backoff(&self.policy, is_transient, |_| self.access.read(path))
            .await
            .map_err(|source| FileOpError::Io {
                operation: "read",
                path: path.to_path_buf(),
                attempts: self.policy.max_attempts,
                source,
            })?;

        tracing::debug!("Read {} bytes from {:?}", bytes.len(), path);
        Ok(bytes)
    }

    /// Delete the file once unlocked. A file that is already gone counts
    /// as deleted.
    pub async fn safe_delete(&self, path: &Path) -> Result<(), FileOpError> {
        if !path_exists(path).await {
            tracing::debug!("{:?} already removed", path);
            return Ok(());
        }

        if !self.wait_until_unlocked(path).await {
            return Err(FileOpError::Locked {
                path: path.to_path_buf(),
                attempts: self.policy.max_attempts,
            });
        }

        let result = retry_with_backoff(&self.policy, is_transient, |_| async move {
            match self.access.remove(path).await {
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                other => other,
            }
        })
        .await;

        result.map_err(|source| FileOpError::Io {
            operation: "delete",
            path: path.to_path_buf(),
            attempts: self.policy.max_attempts,
            source,
        })?;

        tracing::debug!("Deleted {:?}", path);
        Ok(())
    }
}

/// Whether `path` exists, treating stat errors as "exists" so callers
/// still go through the lock wait
pub async fn path_exists(path: &Path) -> bool {
    match tokio::fs::metadata(path).await {
        Ok(_) => true,
        Err(e) => e.kind() != io::ErrorKind::NotFound,
    }
}

fn is_transient(err: &io::Error) -> bool {
    !matches!(
        err.kind(),
        io::ErrorKind::NotFound | io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData
    )
}
