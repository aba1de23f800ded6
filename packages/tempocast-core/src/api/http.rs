//! Status API routes and handlers.

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::AppState;
use crate::cluster::ClusterView;
use crate::error::{TempoError, TempoResult};
use crate::protocol::{ControlParams, MediaAction, Message, NodeRole, NodeStatusInfo};
use crate::protocol_constants::SERVICE_ID;
use crate::scheduler::{BufferDepth, TrackState};
use crate::services::SessionSummary;
use crate::telemetry::TelemetrySnapshot;

/// Builds the API router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/cluster", get(cluster))
        .route("/sessions", get(sessions))
        .route("/telemetry", get(telemetry))
        .route("/buffer", get(buffer))
        .route("/control", post(control))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Service identification for discovery probes.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    service: &'static str,
    version: &'static str,
    node_id: String,
    role: NodeRole,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        service: SERVICE_ID,
        version: env!("CARGO_PKG_VERSION"),
        node_id: state.services.config.node_id.clone(),
        role: state.services.cluster.role(),
    })
}

/// Node status plus the disciplined clock's current estimates.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
    node_id: String,
    #[serde(flatten)]
    status: NodeStatusInfo,
    /// Current shared time estimate, seconds.
    tau: f64,
    /// Clock offset estimate, seconds.
    clock_offset: f64,
    /// Clock drift estimate, seconds per second.
    clock_drift: f64,
}

async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    let services = &state.services;
    Json(StatusResponse {
        node_id: services.config.node_id.clone(),
        status: services.own_status(),
        tau: services.clock.now(),
        clock_offset: services.clock.offset(),
        clock_drift: services.clock.drift(),
    })
}

async fn cluster(State(state): State<AppState>) -> Json<ClusterView> {
    Json(state.services.cluster.registry.view())
}

async fn sessions(State(state): State<AppState>) -> Json<Vec<SessionSummary>> {
    Json(state.services.sessions.summaries())
}

async fn telemetry(State(state): State<AppState>) -> Json<TelemetrySnapshot> {
    Json(state.services.telemetry.snapshot())
}

/// Scheduler introspection for rendering endpoints.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BufferResponse {
    depth: BufferDepth,
    tracks: Vec<TrackView>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TrackView {
    track_id: String,
    state: TrackState,
    queued: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    volume: Option<f64>,
}

async fn buffer(State(state): State<AppState>) -> TempoResult<Json<BufferResponse>> {
    let Some(buffer) = &state.services.buffer else {
        return Err(TempoError::InvalidState(
            "this node has no rendering buffer".to_string(),
        ));
    };
    let tracks = buffer
        .track_states()
        .into_iter()
        .map(|(track_id, track_state)| TrackView {
            queued: buffer.queue_len(&track_id),
            volume: buffer.track_volume(&track_id),
            track_id,
            state: track_state,
        })
        .collect();
    Ok(Json(BufferResponse {
        depth: buffer.buffer_depth(),
        tracks,
    }))
}

/// Request body for issuing a scheduled playback command.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ControlRequest {
    action: MediaAction,
    track_id: String,
    /// Execution instant in shared virtual seconds.
    start_at: f64,
    #[serde(default)]
    params: ControlParams,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ControlResponse {
    /// Endpoints the command was queued for.
    delivered: usize,
    /// Envelope id, usable for replay-suppression checks.
    command_id: String,
}

/// Issues a `media_control` through the same validation and fan-out path
/// as wire-originated commands.
async fn control(
    State(state): State<AppState>,
    Json(request): Json<ControlRequest>,
) -> TempoResult<Json<ControlResponse>> {
    let services = &state.services;
    let envelope = services.envelope(Message::MediaControl {
        action: request.action,
        track_id: request.track_id,
        start_at: request.start_at,
        params: request.params,
    });
    let delivered = services.router.route(&envelope, "http-api")?;
    Ok(Json(ControlResponse {
        delivered,
        command_id: envelope.id,
    }))
}
