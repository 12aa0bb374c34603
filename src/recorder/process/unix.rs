//! Unix process control
//!
//! Captures run in their own process group so a stop request reaches FFmpeg
//! and anything it forked, and never the recorder itself.

use super::ProcessError;
use std::io;
use tokio::process::Command;

pub(super) fn configure(command: &mut Command) {
    command.process_group(0);
}

pub(super) fn terminate(pid: u32) -> Result<(), ProcessError> {
    signal_group(pid, libc::SIGTERM)
}

pub(super) fn force_kill(pid: u32) -> Result<(), ProcessError> {
    signal_group(pid, libc::SIGKILL)
}

fn signal_group(pid: u32, signal: libc::c_int) -> Result<(), ProcessError> {
    let pgid = libc::pid_t::try_from(pid).map_err(|_| ProcessError::Signal {
        pid,
        message: "pid out of range".to_string(),
    })?;

    // SAFETY: killpg has no memory-safety preconditions. The group id is the
    // child's own pid because it was spawned with process_group(0).
    let rc = unsafe { libc::killpg(pgid, signal) };
    if rc == 0 {
        return Ok(());
    }

    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        // Group already gone
        return Ok(());
    }

    Err(ProcessError::Signal {
        pid,
        message: err.to_string(),
    })
}
