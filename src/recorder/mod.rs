//! Recording system module
//!
//! Everything between "a session is on air" and "a finished recording is
//! stored":
//! - StationSupervisor polls one station's schedule and starts/stops captures
//! - Orchestrator runs one supervisor per station and owns shutdown
//! - Captures are FFmpeg processes tracked in the CaptureRegistry

pub mod capture;
pub mod command;
pub mod context;
pub mod finalize;
pub mod janitor;
pub mod orchestrator;
pub mod process;
pub mod registry;
pub mod state;
pub mod station;

#[cfg(test)]
pub(crate) mod testing;

pub use context::{Collaborators, RecorderContext, RecorderEvent, RecorderSettings};
pub use orchestrator::{HealthReport, Orchestrator, OrchestratorStatus, ShutdownSummary};
pub use process::FfmpegSpawner;
pub use state::{AudioFormat, AudioQuality, RecordingRecord, RecordingStatus};
pub use station::{StationExit, StationSupervisor};
