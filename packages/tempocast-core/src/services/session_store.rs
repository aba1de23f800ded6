//! Session storage with indexed lookups.
//!
//! Provides O(1) session lookups by session id and by node id via a
//! secondary index, plus role-filtered fan-out for command distribution.

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::protocol::{Capability, Envelope, NodeRole};
use crate::utils::now_millis;

/// One attached session as seen by the coordinator.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub session_id: String,
    pub node_id: String,
    pub role: NodeRole,
    pub capabilities: Vec<Capability>,
    /// Source address, for diagnostics.
    pub remote_addr: String,
    /// Queue drained by the session's writer task.
    pub outbound: mpsc::Sender<Envelope>,
    /// Unix millis at handshake completion.
    pub connected_at: u64,
}

/// Serializable session summary for the status API.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session_id: String,
    pub node_id: String,
    pub role: NodeRole,
    pub remote_addr: String,
    pub connected_at: u64,
}

/// Indexed storage for attached sessions.
///
/// The node index eliminates linear scans when routing to a specific peer.
/// A node reconnecting under the same id displaces its old index entry; the
/// stale session's handler cleans itself up on disconnect.
pub struct SessionStore {
    /// Primary: session_id -> SessionHandle
    sessions: DashMap<String, SessionHandle>,
    /// Secondary: node_id -> session_id (O(1) lookup)
    node_index: DashMap<String, String>,
}

impl SessionStore {
    /// Creates a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            node_index: DashMap::new(),
        }
    }

    /// Inserts a session after handshake. Returns the displaced session for
    /// the same session id, if any.
    pub fn insert(&self, handle: SessionHandle) -> Option<SessionHandle> {
        self.node_index
            .insert(handle.node_id.clone(), handle.session_id.clone());
        self.sessions.insert(handle.session_id.clone(), handle)
    }

    /// Removes a session by id. Only removes the node index entry if it
    /// still points at this session (a reconnect may have replaced it).
    pub fn remove(&self, session_id: &str) -> Option<SessionHandle> {
        let removed = self.sessions.remove(session_id).map(|(_, v)| v);
        if let Some(ref handle) = removed {
            self.node_index
                .remove_if(&handle.node_id, |_, stored| stored == session_id);
        }
        removed
    }

    /// Gets a session by id.
    #[must_use]
    pub fn get(&self, session_id: &str) -> Option<SessionHandle> {
        self.sessions.get(session_id).map(|r| r.value().clone())
    }

    /// Gets a session by node id via the secondary index.
    #[must_use]
    pub fn get_by_node(&self, node_id: &str) -> Option<SessionHandle> {
        let session_id = self.node_index.get(node_id)?;
        self.sessions
            .get(session_id.value())
            .map(|r| r.value().clone())
    }

    /// Number of attached sessions.
    #[must_use]
    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Number of attached client sessions.
    #[must_use]
    pub fn client_count(&self) -> u64 {
        self.sessions
            .iter()
            .filter(|r| r.value().role == NodeRole::Client)
            .count() as u64
    }

    /// Fans a message out to every session with the given role, excluding
    /// the originator. Sessions with a full outbound queue are skipped -
    /// a peer that cannot drain its queue must not stall the others.
    ///
    /// Returns the number of sessions the message was queued for.
    pub fn fan_out(&self, envelope: &Envelope, role: NodeRole, exclude_session: &str) -> usize {
        let mut delivered = 0;
        for entry in self.sessions.iter() {
            let handle = entry.value();
            if handle.role != role || handle.session_id == exclude_session {
                continue;
            }
            match handle.outbound.try_send(envelope.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    log::warn!(
                        "[Session] Outbound queue full, dropping fan-out for {}",
                        handle.session_id
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    // Session is tearing down; its handler removes it.
                }
            }
        }
        delivered
    }

    /// Summaries for the status API.
    #[must_use]
    pub fn summaries(&self) -> Vec<SessionSummary> {
        self.sessions
            .iter()
            .map(|r| {
                let h = r.value();
                SessionSummary {
                    session_id: h.session_id.clone(),
                    node_id: h.node_id.clone(),
                    role: h.role,
                    remote_addr: h.remote_addr.clone(),
                    connected_at: h.connected_at,
                }
            })
            .collect()
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Builds a handle for a freshly completed handshake.
#[must_use]
pub fn handle_for(
    session_id: &str,
    node_id: &str,
    role: NodeRole,
    capabilities: Vec<Capability>,
    remote_addr: &str,
    outbound: mpsc::Sender<Envelope>,
) -> SessionHandle {
    SessionHandle {
        session_id: session_id.to_string(),
        node_id: node_id.to_string(),
        role,
        capabilities,
        remote_addr: remote_addr.to_string(),
        outbound,
        connected_at: now_millis(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Message;

    fn handle(session_id: &str, node_id: &str, role: NodeRole) -> (SessionHandle, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(4);
        (
            handle_for(session_id, node_id, role, vec![Capability::Audio], "127.0.0.1:1", tx),
            rx,
        )
    }

    fn probe_envelope() -> Envelope {
        Envelope::new("server", 1, Message::ClockSync { t1: 0.0 })
    }

    #[test]
    fn lookup_by_node_id_uses_index() {
        let store = SessionStore::new();
        let (h, _rx) = handle("s1", "endpoint-a", NodeRole::Client);
        store.insert(h);

        assert_eq!(store.get_by_node("endpoint-a").unwrap().session_id, "s1");
        assert!(store.get_by_node("endpoint-b").is_none());
    }

    #[test]
    fn remove_keeps_index_of_reconnected_node() {
        let store = SessionStore::new();
        let (old, _rx1) = handle("s1", "endpoint-a", NodeRole::Client);
        let (new, _rx2) = handle("s2", "endpoint-a", NodeRole::Client);
        store.insert(old);
        store.insert(new);

        // Tearing down the old session must not orphan the new one's index.
        store.remove("s1");
        assert_eq!(store.get_by_node("endpoint-a").unwrap().session_id, "s2");
    }

    #[test]
    fn fan_out_reaches_clients_only() {
        let store = SessionStore::new();
        let (client_a, mut rx_a) = handle("s1", "a", NodeRole::Client);
        let (client_b, mut rx_b) = handle("s2", "b", NodeRole::Client);
        let (replica, mut rx_r) = handle("s3", "r", NodeRole::Replica);
        store.insert(client_a);
        store.insert(client_b);
        store.insert(replica);

        let delivered = store.fan_out(&probe_envelope(), NodeRole::Client, "s0");
        assert_eq!(delivered, 2);
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_ok());
        assert!(rx_r.try_recv().is_err());
    }

    #[test]
    fn fan_out_excludes_the_originator() {
        let store = SessionStore::new();
        let (client, mut rx) = handle("s1", "a", NodeRole::Client);
        store.insert(client);

        let delivered = store.fan_out(&probe_envelope(), NodeRole::Client, "s1");
        assert_eq!(delivered, 0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn full_outbound_queue_is_skipped() {
        let store = SessionStore::new();
        let (tx, _rx) = mpsc::channel(1);
        store.insert(handle_for(
            "s1",
            "a",
            NodeRole::Client,
            vec![],
            "127.0.0.1:1",
            tx,
        ));

        assert_eq!(store.fan_out(&probe_envelope(), NodeRole::Client, "x"), 1);
        // Queue of 1 is now full; the next fan-out skips rather than blocks.
        assert_eq!(store.fan_out(&probe_envelope(), NodeRole::Client, "x"), 0);
    }
}
