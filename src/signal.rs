//! Shutdown signals

use std::io;

/// Waits for SIGTERM or SIGINT
#[cfg(unix)]
async fn wait_for_signal_impl() -> io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    let mut interrupt = signal(SignalKind::interrupt())?;

    Ok(tokio::select! {
        _ = terminate.recv() => "SIGTERM",
        _ = interrupt.recv() => "SIGINT",
    })
}

/// Waits for any console control event that asks the process to go away
#[cfg(windows)]
async fn wait_for_signal_impl() -> io::Result<&'static str> {
    use tokio::signal::windows;

    // Capture processes run in their own process group, so the CTRL_BREAK
    // we send them never lands here.
    let mut ctrl_c = windows::ctrl_c()?;
    let mut ctrl_break = windows::ctrl_break()?;
    let mut ctrl_close = windows::ctrl_close()?;
    let mut ctrl_shutdown = windows::ctrl_shutdown()?;

    Ok(tokio::select! {
        _ = ctrl_c.recv() => "CTRL_C",
        _ = ctrl_break.recv() => "CTRL_BREAK",
        _ = ctrl_close.recv() => "CTRL_CLOSE",
        _ = ctrl_shutdown.recv() => "CTRL_SHUTDOWN",
    })
}

/// Registers signal handlers and waits until shutdown is requested.
/// Returns the name of the signal.
pub async fn wait_for_stop_signal() -> io::Result<&'static str> {
    wait_for_signal_impl().await
}
