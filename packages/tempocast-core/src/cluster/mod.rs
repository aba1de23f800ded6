//! Cluster membership: roles, health scoring and the shared view.
//!
//! The coordinator side of the control plane keeps a registry of peers
//! (replicas and clients) built from `node_status` broadcasts. The registry
//! feeds the `cluster_info` block of `hello` replies and the candidate
//! scores used by the election.

pub mod election;
pub mod rebind;

pub use election::{ElectionAction, ElectionConfig, ElectionEngine, ElectionRole};
pub use rebind::RebindPlanner;

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;

use crate::protocol::{ClusterInfo, NodeRole, NodeStatusInfo};
use crate::protocol_constants::SCORE_WEIGHTS;
use crate::utils::monotonic_secs;

/// Composite candidate health score in [0, 1].
///
/// `S = w₁·(1 − cpu) + w₂·(1 − mem) + w₃·net_quality + w₄·(battery or 1)`.
/// Mains-powered nodes score a full battery term.
#[must_use]
pub fn candidate_score(status: &NodeStatusInfo) -> f64 {
    let [w_cpu, w_mem, w_net, w_batt] = SCORE_WEIGHTS;
    let score = w_cpu * (1.0 - status.cpu).clamp(0.0, 1.0)
        + w_mem * (1.0 - status.mem).clamp(0.0, 1.0)
        + w_net * status.net_quality.clamp(0.0, 1.0)
        + w_batt * status.battery.unwrap_or(1.0).clamp(0.0, 1.0);
    score.clamp(0.0, 1.0)
}

/// Point-in-time view of cluster coordination state.
///
/// `master_id` is empty only while an election is in flight; `term` advances
/// monotonically across elections and `epoch` counts master promotions.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterView {
    pub master_id: Option<String>,
    /// Replica ids ordered by last-advertised score, best first.
    pub replica_ids: Vec<String>,
    pub term: u64,
    pub epoch: u64,
}

/// One peer as last advertised by its `node_status`.
#[derive(Debug, Clone)]
struct PeerRecord {
    status: NodeStatusInfo,
    score: f64,
    last_seen: f64,
}

/// Registry of peers known to this node.
///
/// Populated from `node_status` broadcasts; consulted for `hello` replies,
/// the HTTP `/cluster` endpoint and election scoring.
pub struct ClusterRegistry {
    peers: DashMap<String, PeerRecord>,
    master_id: RwLock<Option<String>>,
    term: AtomicU64,
    epoch: AtomicU64,
}

impl ClusterRegistry {
    /// Creates an empty registry at term 0.
    #[must_use]
    pub fn new() -> Self {
        Self {
            peers: DashMap::new(),
            master_id: RwLock::new(None),
            term: AtomicU64::new(0),
            epoch: AtomicU64::new(0),
        }
    }

    /// Records a peer's `node_status` broadcast.
    pub fn observe_status(&self, node_id: &str, status: NodeStatusInfo) {
        let score = candidate_score(&status);
        if status.role == NodeRole::Master {
            let mut master = self.master_id.write();
            if master.as_deref() != Some(node_id) {
                log::info!("[Cluster] Master is now {node_id}");
                *master = Some(node_id.to_string());
                self.epoch.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.peers.insert(
            node_id.to_string(),
            PeerRecord {
                status,
                score,
                last_seen: monotonic_secs(),
            },
        );
    }

    /// Removes a peer (session closed).
    pub fn forget(&self, node_id: &str) {
        self.peers.remove(node_id);
        let mut master = self.master_id.write();
        if master.as_deref() == Some(node_id) {
            *master = None;
        }
    }

    /// Marks the local node as master for `term`.
    pub fn promote_self(&self, node_id: &str, term: u64) {
        *self.master_id.write() = Some(node_id.to_string());
        self.term.store(term, Ordering::Relaxed);
        self.epoch.fetch_add(1, Ordering::Relaxed);
    }

    /// Clears the master while an election is in flight.
    pub fn clear_master(&self, term: u64) {
        *self.master_id.write() = None;
        self.term.fetch_max(term, Ordering::Relaxed);
    }

    /// Last observed score for a peer, if any.
    #[must_use]
    pub fn score_of(&self, node_id: &str) -> Option<f64> {
        self.peers.get(node_id).map(|r| r.score)
    }

    /// Replica ids ordered by advertised score, best first; score ties break
    /// toward the lowest node id.
    #[must_use]
    pub fn replicas_by_score(&self) -> Vec<String> {
        let mut replicas: Vec<(String, f64)> = self
            .peers
            .iter()
            .filter(|r| r.value().status.role == NodeRole::Replica)
            .map(|r| (r.key().clone(), r.value().score))
            .collect();
        replicas.sort_by(|(id_a, score_a), (id_b, score_b)| {
            score_b
                .total_cmp(score_a)
                .then_with(|| id_a.cmp(id_b))
        });
        replicas.into_iter().map(|(id, _)| id).collect()
    }

    /// The current view, for `/cluster` and `hello` replies.
    #[must_use]
    pub fn view(&self) -> ClusterView {
        ClusterView {
            master_id: self.master_id.read().clone(),
            replica_ids: self.replicas_by_score(),
            term: self.term.load(Ordering::Relaxed),
            epoch: self.epoch.load(Ordering::Relaxed),
        }
    }

    /// The `cluster_info` block advertised in `hello` replies.
    #[must_use]
    pub fn cluster_info(&self) -> ClusterInfo {
        let view = self.view();
        ClusterInfo {
            master_id: view.master_id,
            replica_ids: view.replica_ids,
            term: view.term,
        }
    }

    /// Seconds since the given peer was last heard from.
    #[must_use]
    pub fn silence_of(&self, node_id: &str) -> Option<f64> {
        self.peers
            .get(node_id)
            .map(|r| monotonic_secs() - r.last_seen)
    }
}

impl Default for ClusterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(role: NodeRole, cpu: f64, mem: f64, net: f64, battery: Option<f64>) -> NodeStatusInfo {
        NodeStatusInfo {
            role,
            connected_clients: 0,
            cpu,
            mem,
            battery,
            net_quality: net,
            avg_rtt: 0.01,
            loss: 0.0,
        }
    }

    #[test]
    fn score_weights_sum_to_one_for_perfect_node() {
        let s = status(NodeRole::Replica, 0.0, 0.0, 1.0, None);
        assert!((candidate_score(&s) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn battery_absence_scores_as_full() {
        let mains = status(NodeRole::Replica, 0.5, 0.5, 0.5, None);
        let battery = status(NodeRole::Replica, 0.5, 0.5, 0.5, Some(1.0));
        assert_eq!(candidate_score(&mains), candidate_score(&battery));
        let low = status(NodeRole::Replica, 0.5, 0.5, 0.5, Some(0.1));
        assert!(candidate_score(&low) < candidate_score(&mains));
    }

    #[test]
    fn replicas_ordered_by_score_desc() {
        let registry = ClusterRegistry::new();
        registry.observe_status("b", status(NodeRole::Replica, 0.5, 0.5, 0.5, None));
        registry.observe_status("c", status(NodeRole::Replica, 0.1, 0.1, 0.9, None));
        registry.observe_status("client-1", status(NodeRole::Client, 0.0, 0.0, 1.0, None));

        assert_eq!(registry.replicas_by_score(), vec!["c", "b"]);
    }

    #[test]
    fn master_status_updates_view_and_epoch() {
        let registry = ClusterRegistry::new();
        registry.observe_status("a", status(NodeRole::Master, 0.2, 0.2, 0.9, None));
        let view = registry.view();
        assert_eq!(view.master_id.as_deref(), Some("a"));
        assert_eq!(view.epoch, 1);

        // Same master again: epoch unchanged.
        registry.observe_status("a", status(NodeRole::Master, 0.3, 0.2, 0.9, None));
        assert_eq!(registry.view().epoch, 1);

        // Failover to a new master bumps the epoch.
        registry.observe_status("c", status(NodeRole::Master, 0.2, 0.2, 0.9, None));
        assert_eq!(registry.view().epoch, 2);
    }

    #[test]
    fn forgetting_the_master_clears_the_view() {
        let registry = ClusterRegistry::new();
        registry.observe_status("a", status(NodeRole::Master, 0.2, 0.2, 0.9, None));
        registry.forget("a");
        assert_eq!(registry.view().master_id, None);
    }
}
