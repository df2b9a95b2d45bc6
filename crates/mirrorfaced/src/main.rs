use anyhow::{Context, Result};
use clap::Parser;
use mirrorface_core::OnnxVision;
use mirrorface_hw::{SourceKind, VideoSource, VideoSourceConfig};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

mod config;
mod recognition;
mod retry;
mod status;

use config::Config;
use recognition::{LoopSettings, RecognitionLoop};
use status::StatusFile;

/// Recognize the enrolled face and publish its label to the mirror module.
#[derive(Parser, Debug)]
#[command(name = "mirrorfaced", version, about)]
struct Args {
    /// Video source: onboard, network or usb.
    #[arg(long, default_value = "onboard")]
    source: SourceKind,

    /// Stream URL, required when --source network.
    #[arg(long)]
    network_url: Option<String>,

    /// USB camera index (/dev/videoN).
    #[arg(long, default_value_t = 0)]
    usb_index: u32,

    /// Optional TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            let _ = err.print();
            return if err.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    match run(args).await {
        Ok(()) => {
            tracing::info!("mirrorfaced stopped");
            ExitCode::SUCCESS
        }
        Err(err) => {
            tracing::error!(error = %format!("{err:#}"), "mirrorfaced failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<()> {
    let config = Config::load(args.config.as_deref()).context("loading configuration")?;
    tracing::info!(
        source = %args.source,
        module_dir = %config.module_dir.display(),
        model_dir = %config.model_dir.display(),
        "mirrorfaced starting"
    );

    let source_config = VideoSourceConfig::new(args.source, args.network_url, args.usb_index)?
        .with_onboard_device(config.onboard_device.clone())
        .with_network_timeout(config.network_timeout());
    let source = VideoSource::new(&source_config);
    let location = source.describe();

    let retry = config.retry_policy();
    tracing::info!(
        max_attempts = ?retry.max_attempts(),
        delay_ms = retry.base_delay().as_millis() as u64,
        "capture retry policy"
    );

    let settings = LoopSettings {
        reference_image: config.reference_image.clone(),
        identity_dir: config.identity_dir.clone(),
        status: StatusFile::new(config.status_file.clone()),
        retry,
        cooldown: config.cooldown(),
        label_refresh: config.label_refresh,
    };

    let recognition = RecognitionLoop::start(source, || OnnxVision::load(&config.model_dir), settings)
        .with_context(|| format!("starting recognition on {location}"))?;
    tracing::info!(source = %location, label = %recognition.state().display_label, "reference face enrolled");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::spawn(async move {
        tokio::select! {
            _ = interrupt.recv() => tracing::info!("SIGINT received, shutting down"),
            _ = terminate.recv() => tracing::info!("SIGTERM received, shutting down"),
        }
        shutdown_tx.send_replace(true);
    });

    recognition.run(shutdown_rx).await?;
    Ok(())
}
