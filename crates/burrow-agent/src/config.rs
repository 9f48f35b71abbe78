//! Agent configuration

use crate::AgentError;
use burrow_proto::{PipelineMode, TransportKind};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Reconnect backoff tuning
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReconnectConfig {
    pub initial_secs: u64,
    pub max_secs: u64,
    /// Give up after this many consecutive failures; `None` retries forever
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_secs: 1,
            max_secs: 60,
            max_attempts: None,
        }
    }
}

impl ReconnectConfig {
    pub fn initial(&self) -> Duration {
        Duration::from_secs(self.initial_secs)
    }

    pub fn max(&self) -> Duration {
        Duration::from_secs(self.max_secs)
    }
}

fn default_transport() -> TransportKind {
    TransportKind::Stream
}

fn default_handshake_secs() -> u64 {
    10
}

/// Agent configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Bridge address, "host:port"
    pub server_addr: String,
    /// Verification secret known to the bridge
    pub secret: String,
    #[serde(default = "default_transport")]
    pub transport: TransportKind,
    /// Pipeline requested for everything after the handshake
    #[serde(default)]
    pub pipeline: PipelineMode,
    /// Optional HTTP CONNECT proxy to dial the bridge through,
    /// "http://[user:pass@]host:port"
    #[serde(default)]
    pub proxy_url: Option<String>,
    #[serde(default = "default_handshake_secs")]
    pub handshake_secs: u64,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

impl AgentConfig {
    pub fn new(server_addr: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            server_addr: server_addr.into(),
            secret: secret.into(),
            transport: default_transport(),
            pipeline: PipelineMode::default(),
            proxy_url: None,
            handshake_secs: default_handshake_secs(),
            reconnect: ReconnectConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<(), AgentError> {
        if self.server_addr.is_empty() {
            return Err(AgentError::Config("server_addr is empty".to_string()));
        }
        if self.secret.is_empty() {
            return Err(AgentError::Config("secret is empty".to_string()));
        }
        if let Some(url) = &self.proxy_url {
            crate::proxy::parse_proxy_url(url)?;
        }
        Ok(())
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_secs)
    }
}
