//! Tunnel agent
//!
//! Dials out to a bridge, authenticates with its verification secret, and
//! serves the logical streams the bridge opens by dialing private targets.
//! The connection is kept alive across failures with exponential backoff.

pub mod config;
pub mod log;
pub mod proxy;
pub mod session;

pub use config::{AgentConfig, ReconnectConfig};
pub use log::LogBuffer;
pub use session::{AgentHandle, AgentSession, AgentStatus};

use burrow_proto::AuthRejectReason;
use thiserror::Error;

/// Agent errors
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Bridge did not answer the hello in time
    #[error("handshake timed out")]
    HandshakeTimeout,

    /// Bridge refused the handshake
    #[error("bridge rejected handshake: {0}")]
    Rejected(AuthRejectReason),

    #[error("malformed handshake reply: {0}")]
    MalformedReply(String),

    #[error("proxy error: {0}")]
    Proxy(String),

    #[error(transparent)]
    Mux(#[from] burrow_mux::MuxError),

    #[error(transparent)]
    Pipeline(#[from] burrow_pipeline::PipelineError),

    #[error("invalid configuration: {0}")]
    Config(String),
}
