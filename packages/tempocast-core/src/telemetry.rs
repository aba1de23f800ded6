//! Telemetry counters backing the HTTP status API.
//!
//! [`Telemetry`] is an [`EventEmitter`] that folds events into lock-free
//! counters and logs the operationally interesting ones. Services emit
//! through the trait; the `/telemetry` endpoint reads a snapshot.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::events::{BufferEvent, ClusterEvent, EventEmitter, SessionEvent};

/// Lock-free event counters.
#[derive(Debug, Default)]
pub struct Telemetry {
    late_frames: AtomicU64,
    too_far_frames: AtomicU64,
    underruns: AtomicU64,
    queue_pressure: AtomicU64,
    sessions_opened: AtomicU64,
    sessions_closed: AtomicU64,
    rate_limited: AtomicU64,
    elections: AtomicU64,
}

/// Point-in-time copy of the counters, serialized by the status API.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetrySnapshot {
    pub late_frames: u64,
    pub too_far_frames: u64,
    pub underruns: u64,
    pub queue_pressure: u64,
    pub sessions_opened: u64,
    pub sessions_closed: u64,
    pub rate_limited: u64,
    pub elections: u64,
}

impl Telemetry {
    /// Creates zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copies the current counter values.
    #[must_use]
    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            late_frames: self.late_frames.load(Ordering::Relaxed),
            too_far_frames: self.too_far_frames.load(Ordering::Relaxed),
            underruns: self.underruns.load(Ordering::Relaxed),
            queue_pressure: self.queue_pressure.load(Ordering::Relaxed),
            sessions_opened: self.sessions_opened.load(Ordering::Relaxed),
            sessions_closed: self.sessions_closed.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            elections: self.elections.load(Ordering::Relaxed),
        }
    }
}

impl EventEmitter for Telemetry {
    fn emit_buffer(&self, event: BufferEvent) {
        match &event {
            BufferEvent::LateFrame {
                track_id,
                lateness_ms,
                ..
            } => {
                self.late_frames.fetch_add(1, Ordering::Relaxed);
                log::debug!(
                    "[Buffer] Late frame dropped: track={track_id}, late={lateness_ms:.1}ms"
                );
            }
            BufferEvent::TooFar {
                track_id, lead_ms, ..
            } => {
                self.too_far_frames.fetch_add(1, Ordering::Relaxed);
                log::debug!(
                    "[Buffer] Far-future frame dropped: track={track_id}, lead={lead_ms:.0}ms"
                );
            }
            BufferEvent::Underrun { track_id, .. } => {
                self.underruns.fetch_add(1, Ordering::Relaxed);
                log::warn!("[Buffer] Underrun: track={track_id}");
            }
            BufferEvent::QueuePressure {
                track_id,
                queue_len,
                ..
            } => {
                self.queue_pressure.fetch_add(1, Ordering::Relaxed);
                log::warn!("[Buffer] Queue pressure: track={track_id}, len={queue_len}");
            }
        }
    }

    fn emit_session(&self, event: SessionEvent) {
        match &event {
            SessionEvent::Opened {
                session_id,
                node_id,
                ..
            } => {
                self.sessions_opened.fetch_add(1, Ordering::Relaxed);
                log::info!("[Session] Opened: {session_id} (node {node_id})");
            }
            SessionEvent::Closed { session_id, .. } => {
                self.sessions_closed.fetch_add(1, Ordering::Relaxed);
                log::info!("[Session] Closed: {session_id}");
            }
            SessionEvent::RateLimited { session_id, .. } => {
                self.rate_limited.fetch_add(1, Ordering::Relaxed);
                log::debug!("[Session] Rate limited: {session_id}");
            }
        }
    }

    fn emit_cluster(&self, event: ClusterEvent) {
        match &event {
            ClusterEvent::RoleChanged { role, term, .. } => {
                log::info!("[Cluster] Role changed: {role} (term {term})");
            }
            ClusterEvent::MasterLost {
                last_master_id,
                term,
                ..
            } => {
                self.elections.fetch_add(1, Ordering::Relaxed);
                log::warn!("[Cluster] Master lost: {last_master_id:?} (term {term})");
            }
            ClusterEvent::LeaderElected {
                leader_id, term, ..
            } => {
                log::info!("[Cluster] Leader elected: {leader_id} (term {term})");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_track_emitted_events() {
        let telemetry = Telemetry::new();
        telemetry.emit_buffer(BufferEvent::LateFrame {
            track_id: "t".into(),
            lateness_ms: 200.0,
            timestamp: 0,
        });
        telemetry.emit_buffer(BufferEvent::Underrun {
            track_id: "t".into(),
            timestamp: 0,
        });
        telemetry.emit_session(SessionEvent::RateLimited {
            session_id: "s".into(),
            timestamp: 0,
        });

        let snap = telemetry.snapshot();
        assert_eq!(snap.late_frames, 1);
        assert_eq!(snap.underruns, 1);
        assert_eq!(snap.rate_limited, 1);
        assert_eq!(snap.too_far_frames, 0);
    }
}
