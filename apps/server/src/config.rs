//! Server configuration.
//!
//! Supports loading from YAML files with environment variable overrides.

use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tempocast_core::{default_node_id, Config, HealthConfig, NodeRole};

/// Server configuration loaded from YAML with environment overrides.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Stable node id; generated from the hostname when unset.
    /// Override: `TEMPOCAST_NODE_ID`
    pub node_id: Option<String>,

    /// Role this coordinator starts in: `master` or `replica`.
    pub role: String,

    /// TCP port for the control plane (framed JSON lines).
    /// Override: `TEMPOCAST_CONTROL_PORT`
    pub control_port: u16,

    /// Port for the HTTP status API.
    /// Override: `TEMPOCAST_HTTP_PORT`
    pub http_port: u16,

    /// Peer coordinator addresses (`host:port`), in preference order.
    /// A replica uses these to find and follow the master.
    pub peers: Vec<String>,

    /// Shared session secret; omit to disable the auth check.
    /// Override: `TEMPOCAST_AUTH_TOKEN`
    pub auth_token: Option<String>,

    /// Seconds between clock-sync probes on the upstream link.
    pub probe_interval_secs: f64,

    /// Seconds of master silence before starting an election.
    pub election_timeout_secs: f64,

    /// Static health inputs for candidate scoring.
    pub health: HealthConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let core = Config::default();
        Self {
            node_id: None,
            role: "master".to_string(),
            control_port: core.control_port,
            http_port: core.http_port,
            peers: Vec::new(),
            auth_token: None,
            probe_interval_secs: core.probe_interval_secs,
            election_timeout_secs: core.election_timeout_secs,
            health: HealthConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Loads configuration from a YAML file, then applies environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Applies environment variable overrides to the configuration.
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("TEMPOCAST_NODE_ID") {
            self.node_id = Some(val);
        }

        if let Ok(val) = std::env::var("TEMPOCAST_CONTROL_PORT") {
            if let Ok(port) = val.parse() {
                self.control_port = port;
            }
        }

        if let Ok(val) = std::env::var("TEMPOCAST_HTTP_PORT") {
            if let Ok(port) = val.parse() {
                self.http_port = port;
            }
        }

        if let Ok(val) = std::env::var("TEMPOCAST_AUTH_TOKEN") {
            self.auth_token = Some(val);
        }
    }

    /// Converts to tempocast-core's Config type.
    pub fn to_core_config(&self) -> Result<Config> {
        let role = match self.role.as_str() {
            "master" => NodeRole::Master,
            "replica" => NodeRole::Replica,
            other => bail!("Invalid role {other:?}: expected \"master\" or \"replica\""),
        };
        if role == NodeRole::Replica && self.peers.is_empty() {
            bail!("A replica needs at least one peer address to follow");
        }

        Ok(Config {
            node_id: self.node_id.clone().unwrap_or_else(default_node_id),
            role,
            control_port: self.control_port,
            http_port: self.http_port,
            peers: self.peers.clone(),
            auth_token: self.auth_token.clone(),
            probe_interval_secs: self.probe_interval_secs,
            election_timeout_secs: self.election_timeout_secs,
            health: self.health.clone(),
            ..Config::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn replica_without_peers_is_rejected() {
        let config = ServerConfig {
            role: "replica".to_string(),
            ..Default::default()
        };
        assert!(config.to_core_config().is_err());
    }

    #[test]
    fn yaml_config_with_peers_loads() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "role: replica\ncontrol_port: 48100\npeers:\n  - \"10.0.0.1:47600\"\nhealth:\n  cpu: 0.1"
        )
        .unwrap();

        let config = ServerConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.control_port, 48100);
        let core = config.to_core_config().unwrap();
        assert_eq!(core.role, NodeRole::Replica);
        assert_eq!(core.peers, vec!["10.0.0.1:47600".to_string()]);
        assert!((core.health.cpu - 0.1).abs() < 1e-12);
    }
}
