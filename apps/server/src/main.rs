//! Tempocast Server - coordinator daemon.
//!
//! Hosts the control plane that endpoints synchronize against: serves the
//! shared clock, validates and fans out scheduled playback commands, and
//! participates in master election when peers are configured. Runs headless
//! as the master or as a warm replica.

mod config;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tempocast_core::net::server::run_control_listener;
use tempocast_core::{bootstrap_services, start_http_server, AppState};
use tokio::net::TcpListener;
use tokio::signal;

use crate::config::ServerConfig;

/// Tempocast Server - clock-synchronized playback coordinator.
#[derive(Parser, Debug)]
#[command(name = "tempocast-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (YAML).
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, default_value = "info", env = "TEMPOCAST_LOG_LEVEL")]
    log_level: log::LevelFilter,

    /// Control-plane port (overrides config file).
    #[arg(short = 'p', long, env = "TEMPOCAST_CONTROL_PORT")]
    control_port: Option<u16>,

    /// Status API port (overrides config file).
    #[arg(long, env = "TEMPOCAST_HTTP_PORT")]
    http_port: Option<u16>,

    /// Start as a replica following these peers (repeatable).
    #[arg(long = "peer", value_name = "HOST:PORT")]
    peers: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    env_logger::Builder::new()
        .filter_level(args.log_level)
        .format_timestamp_millis()
        .init();

    log::info!("Tempocast Server v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let mut config =
        ServerConfig::load(args.config.as_deref()).context("Failed to load configuration")?;

    // Apply CLI overrides
    if let Some(port) = args.control_port {
        config.control_port = port;
    }
    if let Some(port) = args.http_port {
        config.http_port = port;
    }
    if !args.peers.is_empty() {
        config.peers = args.peers.clone();
        config.role = "replica".to_string();
    }

    let core_config = config.to_core_config()?;
    log::info!(
        "Configuration: node_id={}, role={}, control_port={}, http_port={}, peers={:?}",
        core_config.node_id,
        config.role,
        core_config.control_port,
        core_config.http_port,
        core_config.peers
    );

    let control_addr = format!("0.0.0.0:{}", core_config.control_port);
    let http_addr = format!("0.0.0.0:{}", core_config.http_port);

    let services = bootstrap_services(core_config);
    services.start_background_tasks();

    // Control plane (framed JSON over TCP)
    let control_listener = TcpListener::bind(&control_addr)
        .await
        .with_context(|| format!("Failed to bind control port {control_addr}"))?;
    let control_handle = tokio::spawn(run_control_listener(
        services.clone(),
        control_listener,
        services.cancel_token(),
    ));

    // HTTP status API
    let http_listener = TcpListener::bind(&http_addr)
        .await
        .with_context(|| format!("Failed to bind status port {http_addr}"))?;
    let app_state = AppState::new(services.clone());
    let http_handle = tokio::spawn(start_http_server(
        app_state,
        http_listener,
        services.cancel_token(),
    ));

    // Wait for shutdown signal
    shutdown_signal().await;

    log::info!("Shutdown signal received, cleaning up...");
    services.shutdown().await;

    let _ = control_handle.await;
    let _ = http_handle.await;

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
