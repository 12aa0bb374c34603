//! Station Recorder - scheduled audio capture for radio stations.
//!
//! Every active station gets a supervisor that follows its weekly schedule,
//! records each live session with FFmpeg and hands the finished file to
//! blob storage.

pub mod config;
pub mod preflight;
pub mod recorder;
pub mod schedule;
pub mod signal;
pub mod store;
pub mod utils;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize logging. `RUST_LOG` takes precedence over `level`.
pub fn init_logging(level: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("station_recorder={},warn", level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
