//! Tempocast Core - shared library for Tempocast.
//!
//! This crate provides the core functionality for Tempocast, a system that
//! synchronizes media playback across large fleets of heterogeneous
//! endpoints against a shared virtual clock. It is used by both the
//! coordinator daemon (`tempocast-server`) and the endpoint daemon
//! (`tempocast-node`).
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - [`clock`]: Clock discipline (offset/drift estimation from probes)
//! - [`scheduler`]: Future buffer, timed release and adaptive depth
//! - [`protocol`]: Wire message shapes and version negotiation
//! - [`cluster`]: Election, membership and client re-bind
//! - [`services`]: Session storage, rate limits and command routing
//! - [`net`]: Framed TCP control plane (server and upstream link)
//! - [`api`]: HTTP status API
//! - [`events`]: Event system for telemetry
//! - [`error`]: Centralized error types
//!
//! # Abstraction Traits
//!
//! Two seams decouple core logic from the environment:
//!
//! - [`Renderer`](renderer::Renderer): media output (audio, lighting, UI)
//! - [`EventEmitter`](events::EventEmitter): telemetry sinks
//!
//! Each has a default implementation suitable for the headless binaries.

#![warn(clippy::all)]

pub mod api;
pub mod bootstrap;
pub mod clock;
pub mod cluster;
pub mod error;
pub mod events;
pub mod net;
pub mod protocol;
pub mod protocol_constants;
pub mod renderer;
pub mod scheduler;
pub mod services;
pub mod state;
pub mod telemetry;
pub mod utils;

// Re-export commonly used types at the crate root
pub use api::{start_http_server, AppState};
pub use bootstrap::{bootstrap_services, bootstrap_services_with_renderer, CoreServices};
pub use clock::{DisciplinedClock, LinkStats, SharedClock, SyncProbeDriver};
pub use cluster::{
    candidate_score, ClusterRegistry, ClusterView, ElectionEngine, ElectionRole, RebindPlanner,
};
pub use error::{ErrorCode, TempoError, TempoResult};
pub use events::{BufferEvent, ClusterEvent, EventEmitter, SessionEvent};
pub use protocol::{
    Capability, ClusterInfo, ControlParams, Envelope, MediaAction, MediaCodec, MediaFrame,
    Message, NodeRole, NodeStatusInfo, ScheduledAction,
};
pub use renderer::{LogRenderer, Renderer};
pub use scheduler::{AdaptiveBuffer, FutureBuffer, NetworkQuality, TrackState};
pub use state::{default_node_id, ClusterState, Config, HealthConfig};
pub use telemetry::{Telemetry, TelemetrySnapshot};
pub use utils::{monotonic_secs, now_millis, unix_secs};
