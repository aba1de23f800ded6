//! Core configuration and shared runtime state.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::cluster::{ClusterRegistry, ElectionConfig, ElectionEngine};
use crate::protocol::NodeRole;
use crate::protocol_constants::{
    ELECTION_GATHER_SECS, ELECTION_TIMEOUT_SECS, HEARTBEAT_INTERVAL_SECS, PROBE_INTERVAL_SECS,
    SESSIONS_PER_ADDR_LIMIT,
};
use crate::utils::monotonic_secs;

/// Static health inputs for candidate scoring.
///
/// Real utilization sampling is platform-specific and out of scope; deployments
/// describe the node class here (e.g. a rack server vs. a battery endpoint)
/// and the composite score stays comparable across the cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// CPU utilization in [0, 1].
    pub cpu: f64,
    /// Memory utilization in [0, 1].
    pub mem: f64,
    /// Battery level in [0, 1]; `None` for mains-powered nodes.
    pub battery: Option<f64>,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            cpu: 0.2,
            mem: 0.3,
            battery: None,
        }
    }
}

/// Core configuration shared by the server and node binaries.
#[derive(Debug, Clone)]
pub struct Config {
    /// Stable node identifier; defaults to hostname plus a random suffix.
    pub node_id: String,
    /// Initial role: `Master` serves time authoritatively, `Replica` joins
    /// an existing master, `Client` renders.
    pub role: NodeRole,
    /// Control-plane TCP port (framed JSON lines).
    pub control_port: u16,
    /// HTTP status API port.
    pub http_port: u16,
    /// Peer coordinator addresses (`host:port`), in preference order.
    pub peers: Vec<String>,
    /// Shared secret for session auth; `None` disables the check.
    pub auth_token: Option<String>,
    /// Interval between sync probes, seconds.
    pub probe_interval_secs: f64,
    /// Interval between heartbeats, seconds.
    pub heartbeat_interval_secs: u64,
    /// Master silence before an election, seconds.
    pub election_timeout_secs: f64,
    /// Election gather window, seconds.
    pub election_gather_secs: f64,
    /// Concurrent session limit per source address.
    pub max_sessions_per_addr: usize,
    /// Static health inputs for candidate scoring.
    pub health: HealthConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            role: NodeRole::Master,
            control_port: 47600,
            http_port: 47601,
            peers: Vec::new(),
            auth_token: None,
            probe_interval_secs: PROBE_INTERVAL_SECS,
            heartbeat_interval_secs: HEARTBEAT_INTERVAL_SECS,
            election_timeout_secs: ELECTION_TIMEOUT_SECS,
            election_gather_secs: ELECTION_GATHER_SECS,
            max_sessions_per_addr: SESSIONS_PER_ADDR_LIMIT,
            health: HealthConfig::default(),
        }
    }
}

impl Config {
    /// Election timing derived from this configuration.
    #[must_use]
    pub fn election_config(&self) -> ElectionConfig {
        ElectionConfig {
            timeout: self.election_timeout_secs,
            gather: self.election_gather_secs,
        }
    }
}

/// Hostname-derived default node id with a short random suffix, so several
/// nodes on one host stay distinguishable.
#[must_use]
pub fn default_node_id() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "node".to_string());
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{host}-{}", &suffix[..8])
}

/// Shared cluster-coordination state for a coordinator-capable node.
pub struct ClusterState {
    /// Current role; flips on election outcomes.
    pub role: RwLock<NodeRole>,
    /// The election state machine.
    pub engine: Mutex<ElectionEngine>,
    /// Peer registry built from `node_status` broadcasts.
    pub registry: Arc<ClusterRegistry>,
}

impl ClusterState {
    /// Creates cluster state for the configured initial role.
    #[must_use]
    pub fn new(config: &Config) -> Self {
        Self {
            role: RwLock::new(config.role),
            engine: Mutex::new(ElectionEngine::new(
                config.node_id.clone(),
                config.election_config(),
                monotonic_secs(),
            )),
            registry: Arc::new(ClusterRegistry::new()),
        }
    }

    /// Current role.
    #[must_use]
    pub fn role(&self) -> NodeRole {
        *self.role.read()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_node_ids_are_unique() {
        assert_ne!(default_node_id(), default_node_id());
    }

    #[test]
    fn default_config_is_master_without_peers() {
        let config = Config::default();
        assert_eq!(config.role, NodeRole::Master);
        assert!(config.peers.is_empty());
        assert_eq!(config.election_config().timeout, ELECTION_TIMEOUT_SECS);
    }
}
