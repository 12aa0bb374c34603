//! Capture process handles
//!
//! Each active capture owns one external FFmpeg process. Supervisors only
//! talk to [`ProcessHandle`]; how a process is asked to stop differs per OS
//! and lives in the `unix` and `windows` backends.

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as platform;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
use self::windows as platform;

use super::command::{capture_args, CaptureRequest};
use crate::utils::retry::poll_until;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};

/// How often [`ProcessHandle::wait`] re-checks the process
pub const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Stderr lines kept for diagnostics
const STDERR_TAIL_LINES: usize = 40;

/// Process-related errors
#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to signal process {pid}: {message}")]
    Signal { pid: u32, message: String },

    #[error("process has no pid")]
    NoPid,

    /// Process died before it was considered running; holds its last output
    #[error("process exited during startup: {0}")]
    EarlyExit(String),

    #[error("process IO error: {0}")]
    Io(#[from] io::Error),
}

/// A running external capture process
#[async_trait]
pub trait ProcessHandle: Send + Sync + fmt::Debug {
    /// OS process id, if the process was started
    fn pid(&self) -> Option<u32>;

    fn is_running(&self) -> bool;

    /// Ask the process to exit cleanly (SIGTERM / Ctrl-Break)
    fn terminate(&self) -> Result<(), ProcessError>;

    /// Kill the process without giving it a chance to clean up
    fn force_kill(&self) -> Result<(), ProcessError>;

    /// Recent diagnostic output, for error messages
    fn diagnostics(&self) -> String;

    /// Wait up to `timeout` for the process to exit; true if it did
    async fn wait(&self, timeout: Duration) -> bool {
        poll_until(timeout, WAIT_POLL_INTERVAL, || !self.is_running()).await
    }
}

/// Launches capture processes
pub trait CaptureSpawner: Send + Sync {
    fn spawn(&self, request: &CaptureRequest) -> Result<Arc<dyn ProcessHandle>, ProcessError>;
}

/// Spawns FFmpeg from a configured path
#[derive(Debug, Clone)]
pub struct FfmpegSpawner {
    program: PathBuf,
}

impl FfmpegSpawner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl CaptureSpawner for FfmpegSpawner {
    fn spawn(&self, request: &CaptureRequest) -> Result<Arc<dyn ProcessHandle>, ProcessError> {
        let args = capture_args(request);
        tracing::info!("Starting FFmpeg capture for {}: {:?}", request.label, args);

        let mut command = Command::new(&self.program);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(false);
        platform::configure(&mut command);

        let child = command.spawn().map_err(|source| ProcessError::Spawn {
            program: self.program.display().to_string(),
            source,
        })?;

        let process: Arc<dyn ProcessHandle> =
            Arc::new(FfmpegProcess::from_child(request.label.clone(), child));
        Ok(process)
    }
}

/// Last lines written to a child's stderr
#[derive(Debug, Clone, Default)]
struct StderrTail {
    lines: Arc<Mutex<VecDeque<String>>>,
}

impl StderrTail {
    /// Drain `pipe` in the background so the child never blocks on a full pipe
    fn follow(&self, pipe: ChildStderr, label: String) {
        let lines = self.lines.clone();
        tokio::spawn(async move {
            let mut reader = BufReader::new(pipe).lines();
            while let Ok(Some(line)) = reader.next_line().await {
                tracing::debug!("[ffmpeg {}] {}", label, line);
                let mut lines = lines.lock();
                if lines.len() == STDERR_TAIL_LINES {
                    lines.pop_front();
                }
                lines.push_back(line);
            }
        });
    }

    fn snapshot(&self) -> String {
        self.lines.lock().iter().cloned().collect::<Vec<_>>().join("\n")
    }
}

/// FFmpeg child process behind a [`ProcessHandle`]
#[derive(Debug)]
pub struct FfmpegProcess {
    label: String,
    pid: Option<u32>,
    child: Mutex<Child>,
    exit_status: Mutex<Option<ExitStatus>>,
    stderr: StderrTail,
}

impl FfmpegProcess {
    fn from_child(label: String, mut child: Child) -> Self {
        let stderr = StderrTail::default();
        if let Some(pipe) = child.stderr.take() {
            stderr.follow(pipe, label.clone());
        }

        let pid = child.id();
        tracing::debug!("FFmpeg for {} running as pid {:?}", label, pid);

        Self {
            label,
            pid,
            child: Mutex::new(child),
            exit_status: Mutex::new(None),
            stderr,
        }
    }

    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.is_running();
        *self.exit_status.lock()
    }
}

#[async_trait]
impl ProcessHandle for FfmpegProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn is_running(&self) -> bool {
        let mut exit_status = self.exit_status.lock();
        if exit_status.is_some() {
            return false;
        }

        match self.child.lock().try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                tracing::debug!("FFmpeg for {} exited with {}", self.label, status);
                *exit_status = Some(status);
                false
            }
            Err(e) => {
                tracing::warn!("Failed to poll FFmpeg for {}: {}", self.label, e);
                false
            }
        }
    }

    fn terminate(&self) -> Result<(), ProcessError> {
        if !self.is_running() {
            return Ok(());
        }
        let pid = self.pid.ok_or(ProcessError::NoPid)?;
        tracing::info!("Terminating FFmpeg for {} (pid {})", self.label, pid);
        platform::terminate(pid)
    }

    fn force_kill(&self) -> Result<(), ProcessError> {
        if !self.is_running() {
            return Ok(());
        }
        tracing::warn!("Force killing FFmpeg for {} (pid {:?})", self.label, self.pid);
        if let Some(pid) = self.pid {
            platform::force_kill(pid)?;
        }
        match self.child.lock().start_kill() {
            // Already exited between the check and the kill
            Err(e) if e.kind() == io::ErrorKind::InvalidInput => Ok(()),
            other => other.map_err(ProcessError::from),
        }
    }

    fn diagnostics(&self) -> String {
        let output = self.stderr.snapshot();
        match self.exit_status() {
            Some(status) if output.is_empty() => format!("FFmpeg exited with {}", status),
            Some(status) => format!("FFmpeg exited with {}: {}", status, output),
            None => output,
        }
    }
}
