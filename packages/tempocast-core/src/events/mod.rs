//! Event system for telemetry and observability.
//!
//! This module provides:
//! - [`EventEmitter`] trait for domain services to emit events
//! - Event types for the buffer, session and cluster domains
//!
//! Events are non-fatal by definition: emitting is fire-and-forget and must
//! never block or fail the emitting path. Counters derived from these events
//! back the HTTP telemetry endpoint.

mod emitter;

pub use emitter::{EventEmitter, LoggingEventEmitter, NoopEventEmitter};

use serde::Serialize;

/// Events related to the future buffer and frame scheduling.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum BufferEvent {
    /// A frame arrived after its presentation instant and was dropped.
    LateFrame {
        #[serde(rename = "trackId")]
        track_id: String,
        /// How far past the deadline the frame arrived.
        #[serde(rename = "latenessMs")]
        lateness_ms: f64,
        /// Unix timestamp in milliseconds.
        timestamp: u64,
    },
    /// A frame was scheduled implausibly far ahead and was dropped.
    TooFar {
        #[serde(rename = "trackId")]
        track_id: String,
        #[serde(rename = "leadMs")]
        lead_ms: f64,
        /// Unix timestamp in milliseconds.
        timestamp: u64,
    },
    /// The release loop found a playing track with an empty queue.
    Underrun {
        #[serde(rename = "trackId")]
        track_id: String,
        /// Unix timestamp in milliseconds.
        timestamp: u64,
    },
    /// A track's queue exceeded its depth bound.
    QueuePressure {
        #[serde(rename = "trackId")]
        track_id: String,
        #[serde(rename = "queueLen")]
        queue_len: usize,
        /// Unix timestamp in milliseconds.
        timestamp: u64,
    },
}

/// Events related to control-plane sessions.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SessionEvent {
    /// A session completed its handshake.
    Opened {
        #[serde(rename = "sessionId")]
        session_id: String,
        #[serde(rename = "nodeId")]
        node_id: String,
        /// Unix timestamp in milliseconds.
        timestamp: u64,
    },
    /// A session ended (either side closed, or it was evicted).
    Closed {
        #[serde(rename = "sessionId")]
        session_id: String,
        /// Unix timestamp in milliseconds.
        timestamp: u64,
    },
    /// A message was refused by a rate limiter.
    RateLimited {
        #[serde(rename = "sessionId")]
        session_id: String,
        /// Unix timestamp in milliseconds.
        timestamp: u64,
    },
}

/// Events related to cluster membership and failover.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClusterEvent {
    /// This node changed its election state or role.
    RoleChanged {
        role: String,
        term: u64,
        /// Unix timestamp in milliseconds.
        timestamp: u64,
    },
    /// The master went silent past the election timeout.
    MasterLost {
        #[serde(rename = "lastMasterId")]
        last_master_id: Option<String>,
        term: u64,
        /// Unix timestamp in milliseconds.
        timestamp: u64,
    },
    /// A leader emerged for a term (this node or a peer).
    LeaderElected {
        #[serde(rename = "leaderId")]
        leader_id: String,
        term: u64,
        /// Unix timestamp in milliseconds.
        timestamp: u64,
    },
}
