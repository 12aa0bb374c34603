//! Error types and handling
//!
//! Common error types used across the recorder.

use super::file_ops::FileOpError;
use crate::recorder::process::ProcessError;
use crate::store::StoreError;
use thiserror::Error;

/// Recorder-wide error type
#[derive(Error, Debug)]
pub enum RecorderError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Process error: {0}")]
    Process(#[from] ProcessError),

    #[error("File error: {0}")]
    File(#[from] FileOpError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Preflight validation failed: {}", .0.join("; "))]
    Preflight(Vec<String>),

    #[error("Timed out: {0}")]
    Timeout(String),
}

impl RecorderError {
    /// Stable machine-readable code, used in logs and status snapshots
    pub fn code(&self) -> &'static str {
        match self {
            RecorderError::Io(_) => "IO_ERROR",
            RecorderError::Serialization(_) => "SERIALIZATION_ERROR",
            RecorderError::Config(_) => "CONFIG_ERROR",
            RecorderError::Process(_) => "PROCESS_ERROR",
            RecorderError::File(_) => "FILE_ERROR",
            RecorderError::Store(_) => "STORE_ERROR",
            RecorderError::Preflight(_) => "PREFLIGHT_FAILED",
            RecorderError::Timeout(_) => "TIMEOUT",
        }
    }
}

/// Result type alias using RecorderError
pub type RecorderResult<T> = Result<T, RecorderError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preflight_error_lists_every_failure() {
        let err = RecorderError::Preflight(vec![
            "FFmpeg not found".to_string(),
            "Database unreachable".to_string(),
        ]);

        assert_eq!(err.code(), "PREFLIGHT_FAILED");
        assert_eq!(
            err.to_string(),
            "Preflight validation failed: FFmpeg not found; Database unreachable"
        );
    }
}
