//! Event emitter abstraction for decoupling services from transport.
//!
//! Services depend on the [`EventEmitter`] trait rather than concrete sinks,
//! enabling testing and alternative telemetry backends.

use super::{BufferEvent, ClusterEvent, SessionEvent};

/// Trait for emitting domain events without knowledge of the sink.
///
/// Implementations must be non-blocking; the scheduler emits from its
/// release path.
pub trait EventEmitter: Send + Sync {
    /// Emits a buffer/scheduling event.
    fn emit_buffer(&self, event: BufferEvent);

    /// Emits a session lifecycle event.
    fn emit_session(&self, event: SessionEvent);

    /// Emits a cluster/election event.
    fn emit_cluster(&self, event: ClusterEvent);
}

/// No-op emitter for tests that don't assert on events.
pub struct NoopEventEmitter;

impl EventEmitter for NoopEventEmitter {
    fn emit_buffer(&self, _event: BufferEvent) {
        // No-op
    }

    fn emit_session(&self, _event: SessionEvent) {
        // No-op
    }

    fn emit_cluster(&self, _event: ClusterEvent) {
        // No-op
    }
}

/// Logging emitter for debugging and development.
pub struct LoggingEventEmitter;

impl EventEmitter for LoggingEventEmitter {
    fn emit_buffer(&self, event: BufferEvent) {
        tracing::debug!(?event, "buffer_event");
    }

    fn emit_session(&self, event: SessionEvent) {
        tracing::debug!(?event, "session_event");
    }

    fn emit_cluster(&self, event: ClusterEvent) {
        tracing::debug!(?event, "cluster_event");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Test emitter that counts events per category.
    struct CountingEventEmitter {
        buffer_count: AtomicUsize,
        cluster_count: AtomicUsize,
    }

    impl CountingEventEmitter {
        fn new() -> Self {
            Self {
                buffer_count: AtomicUsize::new(0),
                cluster_count: AtomicUsize::new(0),
            }
        }
    }

    impl EventEmitter for CountingEventEmitter {
        fn emit_buffer(&self, _event: BufferEvent) {
            self.buffer_count.fetch_add(1, Ordering::SeqCst);
        }

        fn emit_session(&self, _event: SessionEvent) {}

        fn emit_cluster(&self, _event: ClusterEvent) {
            self.cluster_count.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn counting_emitter_tracks_events() {
        let emitter = Arc::new(CountingEventEmitter::new());

        emitter.emit_buffer(BufferEvent::Underrun {
            track_id: "t".to_string(),
            timestamp: 0,
        });
        emitter.emit_buffer(BufferEvent::LateFrame {
            track_id: "t".to_string(),
            lateness_ms: 200.0,
            timestamp: 0,
        });
        emitter.emit_cluster(ClusterEvent::RoleChanged {
            role: "master".to_string(),
            term: 1,
            timestamp: 0,
        });

        assert_eq!(emitter.buffer_count.load(Ordering::SeqCst), 2);
        assert_eq!(emitter.cluster_count.load(Ordering::SeqCst), 1);
    }
}
