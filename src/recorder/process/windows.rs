//! Windows process control
//!
//! Captures are started in a new process group so a Ctrl-Break can be
//! delivered to FFmpeg alone; FFmpeg treats it like SIGTERM and finalizes
//! the output file. Hard kills go through `Child::start_kill`.

use super::ProcessError;
use tokio::process::Command;
use windows::Win32::System::Console::{GenerateConsoleCtrlEvent, CTRL_BREAK_EVENT};

const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;

pub(super) fn configure(command: &mut Command) {
    command.creation_flags(CREATE_NEW_PROCESS_GROUP);
}

pub(super) fn terminate(pid: u32) -> Result<(), ProcessError> {
    // SAFETY: plain FFI call, the group id is the child's pid because it
    // was created with CREATE_NEW_PROCESS_GROUP.
    unsafe { GenerateConsoleCtrlEvent(CTRL_BREAK_EVENT, pid) }.map_err(|e| ProcessError::Signal {
        pid,
        message: e.to_string(),
    })
}

pub(super) fn force_kill(_pid: u32) -> Result<(), ProcessError> {
    // TerminateProcess is issued by the caller through Child::start_kill
    Ok(())
}
