// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! sai-cam — edge camera capture agent.
//!
//! Usage:
//!   sai-cam --config /etc/sai-cam/config.yaml
//!   sai-cam --config config.yaml --log-level DEBUG
//!   sai-cam --config config.yaml --local-save     # store only, no uploads
//!   sai-cam --config config.yaml --dry-run        # initialize cameras, exit

use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter, Layer};

use sai_cam::config::NodeConfig;
use sai_cam::service::{CaptureService, LogLevelSetter};

#[derive(Parser)]
#[command(name = "sai-cam", about = "SAI edge camera capture agent", version)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(long, default_value = "/etc/sai-cam/config.yaml")]
    config: PathBuf,
    /// Logging level override.
    #[arg(long, value_parser = ["DEBUG", "INFO", "WARNING", "ERROR"])]
    log_level: Option<String>,
    /// Save images locally without uploading.
    #[arg(long)]
    local_save: bool,
    /// Initialize cameras and exit.
    #[arg(long)]
    dry_run: bool,
}

fn level_directive(level: &str) -> &'static str {
    match level.to_uppercase().as_str() {
        "DEBUG" => "debug",
        "WARNING" => "warn",
        "ERROR" => "error",
        _ => "info",
    }
}

/// Install the tracing subscriber: rolling file writer, optional console
/// layer (TTY or `SAI_CAM_CONSOLE_LOG=1`), and a reloadable level filter.
fn init_logging(
    config: &NodeConfig,
    cli_level: Option<&str>,
) -> (LogLevelSetter, tracing_appender::non_blocking::WorkerGuard) {
    let level = cli_level.unwrap_or(&config.logging.level);
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_directive(level)));
    let (filter, handle) = reload::Layer::new(filter);

    if let Err(e) = std::fs::create_dir_all(&config.logging.log_dir) {
        eprintln!(
            "Warning: cannot create log dir {}: {e}",
            config.logging.log_dir.display()
        );
    }
    // Rotation is left to the platform's logrotate; a size decrease is
    // handled by the tailers.
    let appender =
        tracing_appender::rolling::never(&config.logging.log_dir, &config.logging.log_file);
    let (non_blocking, guard) = tracing_appender::non_blocking(appender);
    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_target(false)
        .with_writer(non_blocking);

    let console = std::io::stderr().is_terminal()
        || std::env::var("SAI_CAM_CONSOLE_LOG").is_ok_and(|v| v == "1");
    let console_layer = console.then(|| {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
            .boxed()
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(console_layer)
        .init();

    let setter: LogLevelSetter = Arc::new(move |level: &str| {
        let directive = level_directive(level);
        if handle.reload(EnvFilter::new(directive)).is_ok() {
            info!(level = directive, "Log level changed");
        }
    });
    (setter, guard)
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match NodeConfig::from_file(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };

    let (log_setter, _log_guard) = init_logging(&config, cli.log_level.as_deref());
    info!(
        version = sai_cam::VERSION,
        config = %cli.config.display(),
        "Starting SAI camera service"
    );

    if let Err(e) = run_service(&cli, config, log_setter).await {
        error!(error = format!("{e:#}"), "Failed to start service");
        std::process::exit(1);
    }
}

async fn run_service(
    cli: &Cli,
    config: NodeConfig,
    log_setter: LogLevelSetter,
) -> anyhow::Result<()> {
    let upload_enabled = !cli.local_save;
    if cli.local_save {
        info!("Upload disabled, running in local save mode");
    }

    let mut service = CaptureService::new(config, cli.config.clone(), upload_enabled, log_setter)
        .context("service construction failed")?;

    if cli.dry_run {
        service.dry_run().await;
        info!("Dry run completed successfully");
        return Ok(());
    }

    service
        .initialize_cameras()
        .await
        .context("camera initialization failed")?;
    service.run().await.context("service run failed")?;
    Ok(())
}
