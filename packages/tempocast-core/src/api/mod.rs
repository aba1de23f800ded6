//! HTTP status API layer.
//!
//! Thin axum handlers over [`CoreServices`]: health, node status, cluster
//! view, session summaries and telemetry counters, plus a control endpoint
//! for issuing scheduled playback commands. Business logic stays in the
//! services; handlers only shape responses.

pub mod http;

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::bootstrap::CoreServices;
use crate::error::TempoError;

/// Shared state for the API layer.
#[derive(Clone)]
pub struct AppState {
    /// The node's service container.
    pub services: Arc<CoreServices>,
}

impl AppState {
    /// Wraps the service container for axum.
    #[must_use]
    pub fn new(services: Arc<CoreServices>) -> Self {
        Self { services }
    }
}

/// Serves the status API until the token is cancelled.
pub async fn start_http_server(
    state: AppState,
    listener: TcpListener,
    cancel: CancellationToken,
) -> Result<(), TempoError> {
    let addr = listener
        .local_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "?".to_string());
    log::info!("[Http] Status API listening on {addr}");

    let app = http::create_router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
        .map_err(|e| TempoError::Internal(format!("http server failed: {e}")))
}
