//! Handshake and stream-open payloads
//!
//! These travel inside `Auth` and `Open` frames, encoded with bincode.

use serde::{Deserialize, Serialize};

/// Physical transport kind requested by an agent
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TransportKind {
    /// Ordered byte stream (TCP)
    Stream,
    /// Datagram-oriented link, still carried through the framed record layer
    Datagram,
}

/// Per-connection compression/encryption configuration
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum PipelineMode {
    #[default]
    None,
    Compress,
    Encrypt,
    Both,
}

impl PipelineMode {
    pub fn compresses(&self) -> bool {
        matches!(self, PipelineMode::Compress | PipelineMode::Both)
    }

    pub fn encrypts(&self) -> bool {
        matches!(self, PipelineMode::Encrypt | PipelineMode::Both)
    }
}

/// Public binding and forwarding mode of a tunnel
///
/// Checked exhaustively at every resolution and dispatch point; a public
/// port is owned by exactly one mode.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum TunnelMode {
    /// Raw TCP forwarding from a public port
    Tcp { bind_port: u16 },
    /// UDP forwarding from a public port, one logical stream per source flow
    Udp { bind_port: u16 },
    /// Virtual-host HTTP forwarding (shared listener, Host + path routing)
    Http { host: String, path_prefix: String },
    /// SOCKS5 CONNECT endpoint; destination comes from the SOCKS request
    Socks5 { bind_port: u16 },
}

impl TunnelMode {
    /// The exclusive public port this mode binds, if any.
    ///
    /// HTTP tunnels share the dispatcher's single HTTP listener and return
    /// `None`.
    pub fn bind_port(&self) -> Option<u16> {
        match self {
            TunnelMode::Tcp { bind_port }
            | TunnelMode::Udp { bind_port }
            | TunnelMode::Socks5 { bind_port } => Some(*bind_port),
            TunnelMode::Http { .. } => None,
        }
    }
}

/// Agent environment details reported during the handshake
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentMetadata {
    pub hostname: String,
    pub platform: String,
    pub version: String,
}

impl Default for AgentMetadata {
    fn default() -> Self {
        Self {
            hostname: hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "unknown".to_string()),
            platform: std::env::consts::OS.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// First frame on a new physical connection: the agent identifies itself
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentHello {
    /// Opaque verification secret known to the bridge
    pub secret: String,
    pub transport: TransportKind,
    /// Highest protocol version the agent speaks
    pub version: u32,
    /// Pipeline the agent wants for everything after the handshake
    pub pipeline: PipelineMode,
    pub metadata: AgentMetadata,
}

/// Why the bridge refused a handshake
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum AuthRejectReason {
    /// Unknown or revoked verification secret
    BadSecret,
    /// Agent or bridge connection quota exhausted
    QuotaExceeded,
    /// No protocol version in common
    UnsupportedVersion { server: u32 },
}

impl std::fmt::Display for AuthRejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthRejectReason::BadSecret => write!(f, "bad verification secret"),
            AuthRejectReason::QuotaExceeded => write!(f, "quota exceeded"),
            AuthRejectReason::UnsupportedVersion { server } => {
                write!(f, "unsupported protocol version (server speaks {})", server)
            }
        }
    }
}

/// Bridge answer to an [`AgentHello`]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum AuthReply {
    Accepted {
        agent_id: String,
        /// Salt mixed into the pipeline key derivation for this session
        session_nonce: [u8; 16],
        /// Negotiated protocol version (min of both sides)
        version: u32,
    },
    Rejected {
        reason: AuthRejectReason,
    },
}

/// Payload of an `Open` frame: which private target the new stream is for
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OpenRequest {
    /// Tunnel that routed the public connection
    pub tunnel_id: String,
    /// Private-side address the agent should dial, "host:port"
    pub target: String,
    /// Whether the target is dialed as a byte stream or a datagram socket
    pub protocol: TransportKind,
    /// Extra per-stream pipeline layered on this tunnel's payload
    pub pipeline: PipelineMode,
}

macro_rules! bincode_codec {
    ($ty:ty) => {
        impl $ty {
            pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
                bincode::serialize(self)
            }

            pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::Error> {
                bincode::deserialize(bytes)
            }
        }
    };
}

bincode_codec!(AgentHello);
bincode_codec!(AuthReply);
bincode_codec!(OpenRequest);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hello_roundtrip() {
        let hello = AgentHello {
            secret: "verify-key-1".to_string(),
            transport: TransportKind::Stream,
            version: crate::PROTOCOL_VERSION,
            pipeline: PipelineMode::Both,
            metadata: AgentMetadata::default(),
        };

        let bytes = hello.to_bytes().unwrap();
        let decoded = AgentHello::from_bytes(&bytes).unwrap();
        assert_eq!(hello, decoded);
    }

    #[test]
    fn test_auth_reply_roundtrip() {
        let reply = AuthReply::Accepted {
            agent_id: "agent-7".to_string(),
            session_nonce: [9u8; 16],
            version: 1,
        };

        let bytes = reply.to_bytes().unwrap();
        assert_eq!(AuthReply::from_bytes(&bytes).unwrap(), reply);

        let rejected = AuthReply::Rejected {
            reason: AuthRejectReason::BadSecret,
        };
        let bytes = rejected.to_bytes().unwrap();
        assert_eq!(AuthReply::from_bytes(&bytes).unwrap(), rejected);
    }

    #[test]
    fn test_open_request_roundtrip() {
        let open = OpenRequest {
            tunnel_id: "web".to_string(),
            target: "127.0.0.1:8080".to_string(),
            protocol: TransportKind::Stream,
            pipeline: PipelineMode::Compress,
        };

        let bytes = open.to_bytes().unwrap();
        assert_eq!(OpenRequest::from_bytes(&bytes).unwrap(), open);
    }

    #[test]
    fn test_garbage_payload_rejected() {
        assert!(AgentHello::from_bytes(&[0xff; 3]).is_err());
    }

    #[test]
    fn test_tunnel_mode_bind_port() {
        assert_eq!(TunnelMode::Tcp { bind_port: 9001 }.bind_port(), Some(9001));
        assert_eq!(TunnelMode::Udp { bind_port: 53 }.bind_port(), Some(53));
        assert_eq!(
            TunnelMode::Socks5 { bind_port: 1080 }.bind_port(),
            Some(1080)
        );
        assert_eq!(
            TunnelMode::Http {
                host: "a.example.com".to_string(),
                path_prefix: "/".to_string()
            }
            .bind_port(),
            None
        );
    }

    #[test]
    fn test_pipeline_mode_flags() {
        assert!(!PipelineMode::None.compresses());
        assert!(!PipelineMode::None.encrypts());
        assert!(PipelineMode::Compress.compresses());
        assert!(PipelineMode::Encrypt.encrypts());
        assert!(PipelineMode::Both.compresses() && PipelineMode::Both.encrypts());
    }
}
