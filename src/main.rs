use anyhow::Context;
use clap::Parser;
use station_recorder::config::Config;
use station_recorder::preflight::PreflightValidator;
use station_recorder::recorder::{Collaborators, FfmpegSpawner, Orchestrator};
use station_recorder::utils::file_ops::LocalFileAccess;
use std::sync::Arc;

#[derive(Parser)]
#[command(version, about)]
struct Args {
    /// Set config file path
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = Config::load(args.config.as_deref())?;
    station_recorder::init_logging(&config.log.level);

    tracing::info!("Starting Station Recorder v{}", env!("CARGO_PKG_VERSION"));

    let settings = config.recorder_settings().context("Invalid recording settings")?;
    let catalog = Arc::new(config.catalog());
    let records = Arc::new(config.record_store());
    let preflight = PreflightValidator::new(
        config.preflight_settings(),
        settings.recording_dir.clone(),
        config.process.ffmpeg_path.clone(),
        settings.timezone,
        records.clone(),
    );

    let collaborators = Collaborators {
        stations: catalog.clone(),
        schedules: catalog,
        records,
        blobs: Arc::new(config.blob_store()),
        spawner: Arc::new(FfmpegSpawner::new(config.process.ffmpeg_path.clone())),
        file_access: Arc::new(LocalFileAccess),
        preflight: Arc::new(preflight),
    };

    let orchestrator = Orchestrator::new(settings, collaborators);
    if let Err(e) = orchestrator.start_all().await {
        tracing::error!("Recorder failed to start [{}]: {}", e.code(), e);
        orchestrator.stop_all().await;
        std::process::exit(1);
    }

    match station_recorder::signal::wait_for_stop_signal().await {
        Ok(signal) => tracing::info!("Received {}, shutting down", signal),
        Err(e) => tracing::error!("Could not listen for stop signals, shutting down: {}", e),
    }

    let summary = orchestrator.stop_all().await;
    if summary.timed_out > 0 {
        tracing::warn!("{} item(s) did not shut down cleanly", summary.timed_out);
    }
    Ok(())
}
