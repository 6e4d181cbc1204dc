//! ZoneAmp Server - standalone control server for ZoneAmp.
//!
//! This binary wires the ZoneAmp control plane (state model, command
//! engine, hardware runtime) to a REST API and runs as a background
//! daemon, typically on the amplifier's embedded board.

mod config;

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use zoneamp_core::Controller;

use crate::config::ServerConfig;

/// ZoneAmp Server - multi-zone home audio control server.
#[derive(Parser, Debug)]
#[command(name = "zoneamp-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (YAML).
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, default_value = "info", env = "ZONEAMP_LOG_LEVEL")]
    log_level: log::LevelFilter,

    /// Bind port (overrides config file).
    #[arg(short = 'p', long, env = "ZONEAMP_BIND_PORT")]
    port: Option<u16>,

    /// Path of the persisted state snapshot (overrides config file).
    #[arg(short = 'f', long, env = "ZONEAMP_CONFIG_FILE")]
    config_file: Option<PathBuf>,

    /// Run against the mock runtime instead of the preamp board.
    #[arg(long)]
    mock_ctrl: bool,

    /// Run with loopback stream drivers instead of player processes.
    #[arg(long)]
    mock_streams: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    env_logger::Builder::new()
        .filter_level(args.log_level)
        .format_timestamp_millis()
        .init();

    log::info!("ZoneAmp Server v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let mut config =
        ServerConfig::load(args.config.as_deref()).context("Failed to load configuration")?;

    // Apply CLI overrides
    if let Some(port) = args.port {
        config.bind_port = port;
    }
    if let Some(config_file) = args.config_file {
        config.config_file = config_file;
    }
    if args.mock_ctrl {
        config.mock_ctrl = true;
    }
    if args.mock_streams {
        config.mock_streams = true;
    }

    log::info!(
        "Configuration: bind={}:{}, config_file={}, mock_ctrl={}, mock_streams={}",
        config.bind_addr,
        config.bind_port,
        config.config_file.display(),
        config.mock_ctrl,
        config.mock_streams
    );

    // Bring up the controller: loads the snapshot, detects units, pushes
    // the configuration out to the hardware.
    let settings = config.to_core_settings();
    let ctrl = Controller::bootstrap(&settings)
        .await
        .context("Failed to bring up the controller")?;

    log::info!("Controller ready");

    let addr = SocketAddr::new(config.bind_addr, config.bind_port);
    let server_ctrl = ctrl.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = zoneamp_core::start_server(addr, server_ctrl).await {
            log::error!("Server error: {}", e);
        }
    });

    // Wait for shutdown signal
    shutdown_signal().await;

    log::info!("Shutdown signal received, cleaning up...");

    // Graceful shutdown: disconnect drivers, flush the pending save.
    ctrl.shutdown().await;
    server_handle.abort();

    log::info!("Shutdown complete");
    Ok(())
}

/// Waits for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
