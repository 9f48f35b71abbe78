//! Bridge configuration
//!
//! Loaded from YAML by the binary and validated before anything binds a
//! socket, so a bad file fails startup instead of surfacing mid-dispatch.

use crate::ServerError;
use burrow_mux::MuxConfig;
use burrow_registry::{AgentSpec, Tunnel};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

fn default_bind_addr() -> SocketAddr {
    "0.0.0.0:8024".parse().unwrap()
}

/// Timeouts and liveness tuning, all in seconds
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Agent must finish the handshake within this window
    pub handshake_secs: u64,
    pub heartbeat_secs: u64,
    /// Connection fails after this many heartbeat intervals without a pong
    pub heartbeat_misses: u32,
    /// Connected agents silent for longer than this are evicted
    pub disconnect_secs: u64,
    /// UDP flows idle for longer than this are reaped
    pub udp_idle_secs: u64,
    /// Public HTTP connections idle for longer than this are closed
    pub http_idle_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            handshake_secs: 10,
            heartbeat_secs: 10,
            heartbeat_misses: 3,
            disconnect_secs: 60,
            udp_idle_secs: 60,
            http_idle_secs: 300,
        }
    }
}

impl TimeoutConfig {
    pub fn handshake(&self) -> Duration {
        Duration::from_secs(self.handshake_secs)
    }

    pub fn disconnect(&self) -> Duration {
        Duration::from_secs(self.disconnect_secs)
    }

    pub fn udp_idle(&self) -> Duration {
        Duration::from_secs(self.udp_idle_secs)
    }

    pub fn http_idle(&self) -> Duration {
        Duration::from_secs(self.http_idle_secs)
    }
}

/// Bridge server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address agents dial into
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,
    /// Shared listener for HTTP virtual-host tunnels; HTTP tunnels are
    /// rejected at validation when unset
    #[serde(default)]
    pub http_bind: Option<SocketAddr>,
    /// Directory for persisted registry state; nothing persists when unset
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
    /// Cap on simultaneously connected agents
    #[serde(default)]
    pub max_agents: Option<usize>,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub agents: Vec<AgentSpec>,
    #[serde(default)]
    pub tunnels: Vec<Tunnel>,
}

impl ServerConfig {
    /// Reject configurations that could not run as written
    pub fn validate(&self) -> Result<(), ServerError> {
        let mut agent_ids = HashSet::new();
        let mut secrets = HashSet::new();
        for agent in &self.agents {
            if agent.id.is_empty() {
                return Err(ServerError::Config("agent with empty id".to_string()));
            }
            if agent.secret.is_empty() {
                return Err(ServerError::Config(format!(
                    "agent {} has an empty secret",
                    agent.id
                )));
            }
            if !agent_ids.insert(&agent.id) {
                return Err(ServerError::Config(format!(
                    "duplicate agent id: {}",
                    agent.id
                )));
            }
            if !secrets.insert(&agent.secret) {
                return Err(ServerError::Config(format!(
                    "agents share a secret (second: {})",
                    agent.id
                )));
            }
        }

        let mut tunnel_ids = HashSet::new();
        for tunnel in &self.tunnels {
            if !tunnel_ids.insert(&tunnel.id) {
                return Err(ServerError::Config(format!(
                    "duplicate tunnel id: {}",
                    tunnel.id
                )));
            }
            if !agent_ids.contains(&tunnel.agent) {
                return Err(ServerError::Config(format!(
                    "tunnel {} references unknown agent {}",
                    tunnel.id, tunnel.agent
                )));
            }
            if matches!(tunnel.mode, burrow_proto::TunnelMode::Http { .. })
                && self.http_bind.is_none()
            {
                return Err(ServerError::Config(format!(
                    "tunnel {} is http but http_bind is not set",
                    tunnel.id
                )));
            }
            tunnel
                .access
                .validate()
                .map_err(|e| ServerError::Config(format!("tunnel {}: {}", tunnel.id, e)))?;
        }

        Ok(())
    }

    /// Multiplexer tuning derived from the timeout section
    pub fn mux_config(&self) -> MuxConfig {
        MuxConfig {
            heartbeat_interval: Duration::from_secs(self.timeouts.heartbeat_secs),
            heartbeat_misses: self.timeouts.heartbeat_misses,
            ..MuxConfig::default()
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            http_bind: None,
            state_dir: None,
            max_agents: None,
            timeouts: TimeoutConfig::default(),
            agents: Vec::new(),
            tunnels: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_yaml() {
        let config: ServerConfig = serde_yaml::from_str("bind_addr: 127.0.0.1:9000").unwrap();
        assert_eq!(config.bind_addr.port(), 9000);
        assert_eq!(config.timeouts, TimeoutConfig::default());
        assert!(config.agents.is_empty());
        config.validate().unwrap();
    }

    #[test]
    fn test_full_yaml() {
        let yaml = r#"
bind_addr: 0.0.0.0:8024
http_bind: 0.0.0.0:8080
timeouts:
  handshake_secs: 5
  heartbeat_secs: 15
  http_idle_secs: 30
agents:
  - id: agent-1
    secret: verify-key-1
tunnels:
  - id: web
    agent: agent-1
    mode: http
    host: app.example.com
    path_prefix: /
    target: 127.0.0.1:3000
  - id: ssh
    agent: agent-1
    mode: tcp
    bind_port: 9022
    target: 127.0.0.1:22
"#;
        let config: ServerConfig = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.timeouts.handshake_secs, 5);
        assert_eq!(config.timeouts.http_idle(), Duration::from_secs(30));
        // Unspecified timeout fields keep their defaults
        assert_eq!(config.timeouts.heartbeat_misses, 3);
        assert_eq!(config.tunnels.len(), 2);
    }

    #[test]
    fn test_tunnel_referencing_unknown_agent_rejected() {
        let yaml = r#"
tunnels:
  - id: ssh
    agent: ghost
    mode: tcp
    bind_port: 9022
    target: 127.0.0.1:22
"#;
        let config: ServerConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(matches!(
            config.validate().unwrap_err(),
            ServerError::Config(_)
        ));
    }

    #[test]
    fn test_http_tunnel_requires_http_bind() {
        let yaml = r#"
agents:
  - id: agent-1
    secret: s1
tunnels:
  - id: web
    agent: agent-1
    mode: http
    host: app.example.com
    path_prefix: /
    target: 127.0.0.1:3000
"#;
        let config: ServerConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duplicate_secret_rejected() {
        let yaml = r#"
agents:
  - id: a
    secret: same
  - id: b
    secret: same
"#;
        let config: ServerConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }
}
