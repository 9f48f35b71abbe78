//! Wire frame format
//!
//! Every unit on a physical bridge connection is a frame: a fixed 10-byte
//! header followed by a variable payload. A single physical connection
//! carries frames for many logical streams, so any decode failure is fatal
//! to the whole connection rather than to one stream.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Stream identifier, unique and monotonic within one physical connection
pub type StreamId = u32;

/// Frame kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// Handshake: identity secret / accept / reject
    Auth = 0,
    /// Open a logical stream (payload carries the target metadata)
    Open = 1,
    /// Stream payload bytes
    Data = 2,
    /// Restore flow-control window credit for a stream
    WindowUpdate = 3,
    /// Half-close or reset a stream
    Close = 4,
    /// Liveness probe
    Ping = 5,
    /// Liveness probe answer
    Pong = 6,
}

impl TryFrom<u8> for FrameKind {
    type Error = FrameDecodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(FrameKind::Auth),
            1 => Ok(FrameKind::Open),
            2 => Ok(FrameKind::Data),
            3 => Ok(FrameKind::WindowUpdate),
            4 => Ok(FrameKind::Close),
            5 => Ok(FrameKind::Ping),
            6 => Ok(FrameKind::Pong),
            _ => Err(FrameDecodeError::UnknownKind(value)),
        }
    }
}

/// Frame flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameFlags(u8);

impl FrameFlags {
    pub const FIN: u8 = 0b0000_0001;
    pub const ACK: u8 = 0b0000_0010;
    pub const RST: u8 = 0b0000_0100;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn with_fin(mut self) -> Self {
        self.0 |= Self::FIN;
        self
    }

    pub fn with_ack(mut self) -> Self {
        self.0 |= Self::ACK;
        self
    }

    pub fn with_rst(mut self) -> Self {
        self.0 |= Self::RST;
        self
    }

    pub fn has_fin(&self) -> bool {
        self.0 & Self::FIN != 0
    }

    pub fn has_ack(&self) -> bool {
        self.0 & Self::ACK != 0
    }

    pub fn has_rst(&self) -> bool {
        self.0 & Self::RST != 0
    }

    pub fn as_u8(&self) -> u8 {
        self.0
    }

    pub fn from_u8(value: u8) -> Self {
        Self(value)
    }
}

impl Default for FrameFlags {
    fn default() -> Self {
        Self::new()
    }
}

/// Frame decode failures
///
/// All of these are protocol violations; the enclosing physical connection
/// must be torn down because corruption cannot be isolated to one stream.
#[derive(Debug, Error)]
pub enum FrameDecodeError {
    #[error("malformed frame: truncated header")]
    TruncatedHeader,

    #[error("malformed frame: unknown kind {0}")]
    UnknownKind(u8),

    #[error("malformed frame: payload length {len} exceeds maximum {max}")]
    LengthOverflow { len: usize, max: usize },

    #[error("malformed frame: payload truncated ({have} of {want} bytes)")]
    TruncatedPayload { have: usize, want: usize },
}

/// One multiplexed frame
#[derive(Debug, Clone)]
pub struct Frame {
    pub stream_id: StreamId,
    pub kind: FrameKind,
    pub flags: FrameFlags,
    pub payload: Bytes,
}

impl Frame {
    /// Header size: stream_id (4) + kind (1) + flags (1) + length (4)
    pub const HEADER_SIZE: usize = 10;

    pub fn new(stream_id: StreamId, kind: FrameKind, payload: Bytes) -> Self {
        Self {
            stream_id,
            kind,
            flags: FrameFlags::new(),
            payload,
        }
    }

    pub fn auth(payload: Bytes) -> Self {
        Self::new(crate::CONTROL_STREAM_ID, FrameKind::Auth, payload)
    }

    pub fn open(stream_id: StreamId, payload: Bytes) -> Self {
        Self::new(stream_id, FrameKind::Open, payload)
    }

    pub fn data(stream_id: StreamId, payload: Bytes) -> Self {
        Self::new(stream_id, FrameKind::Data, payload)
    }

    pub fn window_update(stream_id: StreamId, credit: u32) -> Self {
        Self::new(
            stream_id,
            FrameKind::WindowUpdate,
            Bytes::copy_from_slice(&credit.to_be_bytes()),
        )
    }

    pub fn close(stream_id: StreamId) -> Self {
        Self::new(stream_id, FrameKind::Close, Bytes::new())
    }

    pub fn ping(timestamp_ms: u64) -> Self {
        Self::new(
            crate::CONTROL_STREAM_ID,
            FrameKind::Ping,
            Bytes::copy_from_slice(&timestamp_ms.to_be_bytes()),
        )
    }

    pub fn pong(timestamp_ms: u64) -> Self {
        Self::new(
            crate::CONTROL_STREAM_ID,
            FrameKind::Pong,
            Bytes::copy_from_slice(&timestamp_ms.to_be_bytes()),
        )
    }

    pub fn with_flags(mut self, flags: FrameFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Parse a `WindowUpdate` payload
    pub fn window_credit(&self) -> Result<u32, FrameDecodeError> {
        if self.payload.len() != 4 {
            return Err(FrameDecodeError::TruncatedPayload {
                have: self.payload.len(),
                want: 4,
            });
        }
        let mut buf = [0u8; 4];
        buf.copy_from_slice(&self.payload);
        Ok(u32::from_be_bytes(buf))
    }

    /// Parse a `Ping`/`Pong` payload
    pub fn timestamp_ms(&self) -> Result<u64, FrameDecodeError> {
        if self.payload.len() != 8 {
            return Err(FrameDecodeError::TruncatedPayload {
                have: self.payload.len(),
                want: 8,
            });
        }
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.payload);
        Ok(u64::from_be_bytes(buf))
    }

    /// Encode frame to bytes
    pub fn encode(&self) -> Bytes {
        debug_assert!(self.payload.len() <= crate::MAX_FRAME_SIZE as usize);

        let mut buf = BytesMut::with_capacity(Self::HEADER_SIZE + self.payload.len());

        buf.put_u32(self.stream_id);
        buf.put_u8(self.kind as u8);
        buf.put_u8(self.flags.as_u8());
        buf.put_u32(self.payload.len() as u32);
        buf.put(self.payload.clone());

        buf.freeze()
    }

    /// Decode frame from bytes
    pub fn decode(mut buf: Bytes) -> Result<Self, FrameDecodeError> {
        if buf.len() < Self::HEADER_SIZE {
            return Err(FrameDecodeError::TruncatedHeader);
        }

        let stream_id = buf.get_u32();
        let kind = FrameKind::try_from(buf.get_u8())?;
        let flags = FrameFlags::from_u8(buf.get_u8());
        let length = buf.get_u32() as usize;

        if length > crate::MAX_FRAME_SIZE as usize {
            return Err(FrameDecodeError::LengthOverflow {
                len: length,
                max: crate::MAX_FRAME_SIZE as usize,
            });
        }

        if buf.remaining() != length {
            return Err(FrameDecodeError::TruncatedPayload {
                have: buf.remaining(),
                want: length,
            });
        }

        let payload = buf.split_to(length);

        Ok(Self {
            stream_id,
            kind,
            flags,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_encode_decode() {
        let payload = Bytes::from("hello world");
        let frame = Frame::data(42, payload.clone());

        let encoded = frame.encode();
        let decoded = Frame::decode(encoded).unwrap();

        assert_eq!(decoded.stream_id, 42);
        assert_eq!(decoded.kind, FrameKind::Data);
        assert_eq!(decoded.payload, payload);
    }

    #[test]
    fn test_frame_with_flags() {
        let frame = Frame::close(10).with_flags(FrameFlags::new().with_fin());

        assert!(frame.flags.has_fin());
        assert!(!frame.flags.has_ack());

        let encoded = frame.encode();
        let decoded = Frame::decode(encoded).unwrap();

        assert!(decoded.flags.has_fin());
    }

    #[test]
    fn test_decode_truncated_header() {
        let err = Frame::decode(Bytes::from_static(&[0, 0, 0])).unwrap_err();
        assert!(matches!(err, FrameDecodeError::TruncatedHeader));
    }

    #[test]
    fn test_decode_unknown_kind() {
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u8(0xff);
        buf.put_u8(0);
        buf.put_u32(0);

        let err = Frame::decode(buf.freeze()).unwrap_err();
        assert!(matches!(err, FrameDecodeError::UnknownKind(0xff)));
    }

    #[test]
    fn test_decode_length_overflow() {
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u8(FrameKind::Data as u8);
        buf.put_u8(0);
        buf.put_u32(crate::MAX_FRAME_SIZE + 1);

        let err = Frame::decode(buf.freeze()).unwrap_err();
        assert!(matches!(err, FrameDecodeError::LengthOverflow { .. }));
    }

    #[test]
    fn test_decode_truncated_payload() {
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u8(FrameKind::Data as u8);
        buf.put_u8(0);
        buf.put_u32(16);
        buf.put_slice(b"short");

        let err = Frame::decode(buf.freeze()).unwrap_err();
        assert!(matches!(err, FrameDecodeError::TruncatedPayload { .. }));
    }

    #[test]
    fn test_window_update_credit() {
        let frame = Frame::window_update(7, 65536);
        let decoded = Frame::decode(frame.encode()).unwrap();
        assert_eq!(decoded.kind, FrameKind::WindowUpdate);
        assert_eq!(decoded.window_credit().unwrap(), 65536);
    }

    #[test]
    fn test_ping_timestamp() {
        let frame = Frame::ping(123_456);
        let decoded = Frame::decode(frame.encode()).unwrap();
        assert_eq!(decoded.stream_id, crate::CONTROL_STREAM_ID);
        assert_eq!(decoded.timestamp_ms().unwrap(), 123_456);
    }
}
