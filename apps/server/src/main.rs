//! Matinee Server - standalone watch-party synchronization server.
//!
//! Hosts the room synchronization engine behind an HTTP/WebSocket API.
//! Rooms live in memory; a restart loses all rooms by design.

mod config;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use matinee_core::{start_server, AppState};
use tokio::signal;

use crate::config::ServerConfig;

/// Matinee Server - synchronized watch parties over WebSockets.
#[derive(Parser, Debug)]
#[command(name = "matinee-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (YAML).
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, default_value = "info", env = "MATINEE_LOG_LEVEL")]
    log_level: log::LevelFilter,

    /// Bind port (overrides config file and MATINEE_PORT).
    #[arg(short = 'p', long)]
    port: Option<u16>,

    /// Bind address (overrides config file and MATINEE_HOST).
    #[arg(short = 'H', long)]
    host: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    env_logger::Builder::new()
        .filter_level(args.log_level)
        .format_timestamp_millis()
        .init();

    log::info!("Matinee Server v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let mut config =
        ServerConfig::load(args.config.as_deref()).context("Failed to load configuration")?;

    // Apply CLI overrides
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(host) = args.host {
        config.host = host;
    }

    let core_config = config.to_core_config();
    core_config
        .validate()
        .map_err(anyhow::Error::msg)
        .context("Invalid configuration")?;

    log::info!(
        "Configuration: bind={}:{}, proxy_enabled={}, availability_check={}",
        core_config.host,
        core_config.port,
        core_config.proxy_enabled,
        core_config.availability_check
    );

    let app_state = AppState::new(core_config);

    // Run the server alongside the signal watcher; rooms are in-memory, so
    // shutdown only has to close sockets and stop background tasks.
    let server_state = app_state.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = start_server(server_state).await {
            log::error!("Server error: {}", e);
        }
    });

    shutdown_signal().await;

    log::info!("Shutdown signal received, cleaning up...");
    app_state.shutdown();
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
