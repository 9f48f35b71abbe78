//! Burrow Protocol Definitions
//!
//! This crate defines the wire frame format, handshake messages, and shared
//! protocol constants for the burrow reverse-tunnel bridge.

pub mod frame;
pub mod messages;
pub mod record;

pub use frame::{Frame, FrameDecodeError, FrameFlags, FrameKind, StreamId};
pub use messages::{
    AgentHello, AgentMetadata, AuthReply, AuthRejectReason, OpenRequest, PipelineMode,
    TransportKind, TunnelMode,
};
pub use record::{RecordCodec, RecordCodecError};

/// Protocol capability version exchanged during the handshake
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum frame payload size (1MB)
pub const MAX_FRAME_SIZE: u32 = 1024 * 1024;

/// Maximum encoded record size on the wire.
///
/// A record is one sealed frame; the slack covers the frame header plus
/// AEAD tag and worst-case incompressible deflate expansion.
pub const MAX_RECORD_SIZE: u32 = MAX_FRAME_SIZE + 4096;

/// Reserved stream ID for the control plane (auth, ping/pong)
pub const CONTROL_STREAM_ID: u32 = 0;
