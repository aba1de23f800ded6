//! Tempocast Node - endpoint daemon.
//!
//! Connects to a coordinator, disciplines the local clock to the shared
//! timescale, buffers incoming media against the adaptive future buffer and
//! releases it to the renderer at the scheduled instants. On master loss it
//! re-binds to the best advertised replica without resetting the clock.

mod config;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tempocast_core::{bootstrap_services, start_http_server, AppState};
use tokio::net::TcpListener;
use tokio::signal;

use crate::config::NodeConfig;

/// Tempocast Node - clock-synchronized playback endpoint.
#[derive(Parser, Debug)]
#[command(name = "tempocast-node")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (YAML).
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, default_value = "info", env = "TEMPOCAST_LOG_LEVEL")]
    log_level: log::LevelFilter,

    /// Coordinator address (repeatable; overrides config file).
    #[arg(short = 's', long = "server", value_name = "HOST:PORT")]
    servers: Vec<String>,

    /// Status API port (overrides config file).
    #[arg(long, env = "TEMPOCAST_HTTP_PORT")]
    http_port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    env_logger::Builder::new()
        .filter_level(args.log_level)
        .format_timestamp_millis()
        .init();

    log::info!("Tempocast Node v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let mut config =
        NodeConfig::load(args.config.as_deref()).context("Failed to load configuration")?;

    // Apply CLI overrides
    if !args.servers.is_empty() {
        config.servers = args.servers.clone();
    }
    if let Some(port) = args.http_port {
        config.http_port = port;
    }

    let core_config = config.to_core_config()?;
    log::info!(
        "Configuration: node_id={}, servers={:?}, http_port={}",
        core_config.node_id,
        core_config.peers,
        core_config.http_port
    );

    let http_addr = format!("0.0.0.0:{}", core_config.http_port);

    // Bootstrap with the default logging renderer; real output backends
    // plug in via bootstrap_services_with_renderer.
    let services = bootstrap_services(core_config);
    services.start_background_tasks();

    // HTTP status API (clock, buffer and telemetry introspection)
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
