//! Bridge server
//!
//! Accepts outbound agent connections, multiplexes logical streams over
//! them, and exposes public endpoints (TCP, UDP, HTTP virtual hosts,
//! SOCKS5) that route into the agents' private networks.

pub mod bridge;
pub mod config;
pub mod dispatch;
pub mod health;
pub mod session;

pub use bridge::BridgeServer;
pub use config::{ServerConfig, TimeoutConfig};
pub use dispatch::DispatcherSupervisor;
pub use health::HealthSupervisor;
pub use session::{AgentSession, ConnectionManager};

use thiserror::Error;

/// Server errors
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to bind {addr}: {reason}")]
    Bind { addr: String, reason: String },

    /// Agent did not complete the handshake in time
    #[error("handshake timed out")]
    HandshakeTimeout,

    /// Agent sent something other than a well-formed hello
    #[error("malformed handshake: {0}")]
    MalformedHandshake(String),

    #[error(transparent)]
    Registry(#[from] burrow_registry::RegistryError),

    #[error(transparent)]
    Mux(#[from] burrow_mux::MuxError),

    #[error(transparent)]
    Pipeline(#[from] burrow_pipeline::PipelineError),

    #[error("invalid configuration: {0}")]
    Config(String),
}
