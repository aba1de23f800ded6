//! Endpoint configuration.
//!
//! Supports loading from YAML files with environment variable overrides.

use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tempocast_core::{default_node_id, Config, HealthConfig, NodeRole};

/// Endpoint configuration loaded from YAML with environment overrides.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Stable node id; generated from the hostname when unset.
    /// Override: `TEMPOCAST_NODE_ID`
    pub node_id: Option<String>,

    /// Coordinator addresses (`host:port`), in preference order. The first
    /// reachable master wins; the rest are re-bind candidates.
    pub servers: Vec<String>,

    /// Port for the HTTP status API (buffer and clock introspection).
    /// Override: `TEMPOCAST_HTTP_PORT`
    pub http_port: u16,

    /// Shared session secret; omit when the coordinator has none.
    /// Override: `TEMPOCAST_AUTH_TOKEN`
    pub auth_token: Option<String>,

    /// Seconds between clock-sync probes.
    pub probe_interval_secs: f64,

    /// Static health inputs reported in node_status. Battery endpoints set
    /// `health.battery`.
    pub health: HealthConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        let core = Config::default();
        Self {
            node_id: None,
            servers: Vec::new(),
            http_port: core.http_port + 10,
            auth_token: None,
            probe_interval_secs: core.probe_interval_secs,
            health: HealthConfig::default(),
        }
    }
}

impl NodeConfig {
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
        if self.servers.is_empty() {
            bail!("An endpoint needs at least one coordinator address");
        }

        Ok(Config {
            node_id: self.node_id.clone().unwrap_or_else(default_node_id),
            role: NodeRole::Client,
            http_port: self.http_port,
            peers: self.servers.clone(),
            auth_token: self.auth_token.clone(),
            probe_interval_secs: self.probe_interval_secs,
            health: self.health.clone(),
            ..Config::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_without_servers_is_rejected() {
        assert!(NodeConfig::default().to_core_config().is_err());
    }

    #[test]
    fn servers_become_rebind_peers() {
        let config = NodeConfig {
            servers: vec!["10.0.0.1:47600".into(), "10.0.0.2:47600".into()],
            ..Default::default()
        };
        let core = config.to_core_config().unwrap();
        assert_eq!(core.role, NodeRole::Client);
        assert_eq!(core.peers.len(), 2);
    }
}
