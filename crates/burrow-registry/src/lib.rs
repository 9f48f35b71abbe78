//! Agent and tunnel registries
//!
//! Tracks known agents (identity, status, traffic) and the mapping from
//! public-facing endpoints to tunnels. Both registries are shared between
//! the bridge listener, the proxy dispatchers, and the health supervisor;
//! mutations are serialized per key, never across agents.

pub mod access;
pub mod agents;
pub mod store;
pub mod tunnels;

pub use access::{AccessRule, AccessRuleError};
pub use agents::{Agent, AgentId, AgentRegistry, AgentSpec, AgentStatus};
pub use store::{JsonFileStore, RegistryStore, StoreError};
pub use tunnels::{RegistryEvent, Tunnel, TunnelRegistry};

use thiserror::Error;

/// Registry errors
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Unknown or revoked verification secret
    #[error("authentication failed")]
    AuthFailed,

    /// Connection or traffic quota policy rejected the agent
    #[error("quota exceeded")]
    QuotaExceeded,

    #[error("agent not found: {0}")]
    AgentNotFound(AgentId),

    #[error("tunnel not found: {0}")]
    TunnelNotFound(String),

    /// Public port already bound by another tunnel (any mode)
    #[error("port {0} already in use by tunnel {1}")]
    PortInUse(u16, String),

    /// HTTP host + path prefix already bound by another tunnel
    #[error("host {host}{path_prefix} already in use by tunnel {tunnel_id}")]
    HostConflict {
        host: String,
        path_prefix: String,
        tunnel_id: String,
    },

    /// No tunnel matches an inbound public request
    #[error("no route")]
    NoRoute,

    #[error(transparent)]
    AccessRule(#[from] AccessRuleError),
}
