//! FFmpeg capture command
//!
//! Builds the argument list that records a live stream to a local file,
//! and the file name a capture is written under.

use super::state::{AudioFormat, AudioQuality};
use crate::schedule::ActiveSession;
use chrono::{DateTime, FixedOffset};
use std::path::PathBuf;

/// Everything needed to launch one capture process
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureRequest {
    /// Key of the capture, used for log lines
    pub label: String,

    pub stream_url: String,

    pub output_path: PathBuf,

    pub format: AudioFormat,

    pub quality: AudioQuality,
}

/// FFmpeg arguments for `request`
///
/// Input options precede `-i`; the reconnect options make FFmpeg ride out
/// short stream drops instead of exiting.
pub fn capture_args(request: &CaptureRequest) -> Vec<String> {
    let mut args = vec![
        "-nostdin".to_string(),
        "-hide_banner".to_string(),
        "-loglevel".to_string(),
        "warning".to_string(),
        "-reconnect".to_string(),
        "1".to_string(),
        "-reconnect_streamed".to_string(),
        "1".to_string(),
        "-reconnect_delay_max".to_string(),
        "30".to_string(),
        // microseconds
        "-rw_timeout".to_string(),
        "30000000".to_string(),
        "-i".to_string(),
        request.stream_url.clone(),
        "-vn".to_string(),
    ];

    args.extend([
        "-acodec".to_string(),
        request.format.codec().to_string(),
        "-b:a".to_string(),
        format!("{}k", request.quality.bitrate_kbps()),
        "-ar".to_string(),
        request.quality.sample_rate().to_string(),
        "-ac".to_string(),
        request.quality.channels().to_string(),
    ]);

    if request.format == AudioFormat::Aac {
        args.extend(["-f".to_string(), "adts".to_string()]);
    }

    args.push("-y".to_string());
    args.push(request.output_path.to_string_lossy().into_owned());

    args
}

/// `{station}_{program}_{YYYYMMDD}_{HHMM}_{HHMMSS}_{suffix}.{ext}`
///
/// The date and `HHMM` come from the session, `HHMMSS` from the moment the
/// capture starts, and `suffix` keeps restarts from colliding.
pub fn capture_file_name(
    station_name: &str,
    program_title: Option<&str>,
    active: &ActiveSession,
    started_at: DateTime<FixedOffset>,
    suffix: &str,
    format: AudioFormat,
) -> String {
    let program = program_title
        .map(sanitize_name)
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "unknown_program".to_string());

    format!(
        "{}_{}_{}_{}_{}_{}.{}",
        sanitize_name(station_name),
        program,
        active.session_date.format("%Y%m%d"),
        active.session.start_time.compact(),
        started_at.format("%H%M%S"),
        suffix,
        format.extension()
    )
}

/// Lowercase, with spaces turned into `_` and anything outside
/// `[a-z0-9_-]` dropped
pub fn sanitize_name(name: &str) -> String {
    name.trim()
        .chars()
        .filter_map(|c| match c {
            c if c.is_ascii_alphanumeric() => Some(c.to_ascii_lowercase()),
            '-' | '_' => Some(c),
            c if c.is_whitespace() => Some('_'),
            _ => None,
        })
        .collect()
}
