//! Stream multiplexing over one physical bridge connection
//!
//! Presents many independent ordered byte-streams over a single transport
//! link, with per-stream flow control, ping/pong liveness detection, and
//! cascading teardown: when the physical connection dies, every logical
//! stream it owns is forced closed and nothing stays blocked on it.

mod connection;
pub mod relay;
mod stream;

pub use connection::{MuxConnection, MuxRole};
pub use relay::{relay, relay_with_idle, relay_with_initial, seal_datagram, RelayStats, StreamSeal};
pub use stream::{MuxStream, MuxStreamReader, MuxStreamWriter};

use burrow_proto::{FrameDecodeError, StreamId};
use std::time::Duration;
use thiserror::Error;

/// Multiplexer errors
#[derive(Debug, Error)]
pub enum MuxError {
    /// The physical connection is gone; cascades to every stream on it
    #[error("physical connection closed: {0}")]
    ConnectionClosed(String),

    /// Protocol violation on the shared link; fatal to the connection
    #[error(transparent)]
    MalformedFrame(#[from] FrameDecodeError),

    /// A control payload failed to decode; fatal to the connection
    #[error("malformed control payload: {0}")]
    MalformedPayload(#[from] bincode::Error),

    #[error(transparent)]
    Pipeline(#[from] burrow_pipeline::PipelineError),

    #[error(transparent)]
    Record(#[from] burrow_proto::RecordCodecError),

    /// Peer did not acknowledge a stream open in time; closes only that stream
    #[error("stream open timed out")]
    StreamTimeout,

    /// Peer sent more data than the advertised window; closes only that stream
    #[error("flow control violated on stream {0}")]
    FlowControlViolation(StreamId),

    #[error("stream {0} is closed")]
    StreamClosed(StreamId),

    /// No pong within the configured number of heartbeat intervals
    #[error("heartbeat timed out")]
    HeartbeatTimeout,

    /// Stream opens are only valid from the dialing side
    #[error("this side of the connection cannot open streams")]
    NotDialer,

    /// Peer broke the frame state machine; fatal to the connection
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    /// Socket error while relaying stream payloads
    #[error("relay io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Lifecycle of one logical stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Open sent, waiting for the peer's acknowledgement
    Opening,
    Open,
    /// We signalled close; the peer may still send
    HalfClosedLocal,
    /// The peer signalled close; we may still send
    HalfClosedRemote,
    Closed,
}

/// Multiplexer tuning knobs
#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Flow-control window advertised per stream, in bytes
    pub initial_window: u32,
    /// Largest payload carried by a single data frame.
    ///
    /// Payloads at or below this size travel as one frame, which is what
    /// preserves datagram boundaries for UDP tunnels.
    pub max_data_frame: usize,
    pub heartbeat_interval: Duration,
    /// Connection fails after this many heartbeat intervals without a pong
    pub heartbeat_misses: u32,
    /// How long a stream open may wait for the peer's acknowledgement
    pub open_timeout: Duration,
    /// Incoming opens queued before the acceptor applies backpressure
    pub accept_backlog: usize,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            initial_window: 256 * 1024,
            max_data_frame: 64 * 1024,
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_misses: 3,
            open_timeout: Duration::from_secs(10),
            accept_backlog: 32,
        }
    }
}
