//! Shared utilities

pub mod error;
pub mod file_ops;
pub mod retry;

pub use error::{RecorderError, RecorderResult};
