//! Record layer: length-prefixed units on the physical connection
//!
//! A record is one sealed frame (optionally compressed and/or encrypted by
//! the pipeline), prefixed with a u32 big-endian length. The record codec is
//! deliberately unaware of frame contents so the pipeline can transform
//! whole frames.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Record codec errors
#[derive(Debug, Error)]
pub enum RecordCodecError {
    #[error("malformed record: declared length {len} exceeds maximum {max}")]
    OversizedRecord { len: usize, max: usize },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Length-prefixed record codec for the physical connection
#[derive(Debug, Default)]
pub struct RecordCodec;

impl Decoder for RecordCodec {
    type Item = Bytes;
    type Error = RecordCodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, RecordCodecError> {
        if src.len() < 4 {
            return Ok(None);
        }

        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&src[..4]);
        let len = u32::from_be_bytes(len_bytes) as usize;

        if len > crate::MAX_RECORD_SIZE as usize {
            return Err(RecordCodecError::OversizedRecord {
                len,
                max: crate::MAX_RECORD_SIZE as usize,
            });
        }

        if src.len() < 4 + len {
            src.reserve(4 + len - src.len());
            return Ok(None);
        }

        src.advance(4);
        Ok(Some(src.split_to(len).freeze()))
    }
}

impl Encoder<Bytes> for RecordCodec {
    type Error = RecordCodecError;

    fn encode(&mut self, record: Bytes, dst: &mut BytesMut) -> Result<(), RecordCodecError> {
        if record.len() > crate::MAX_RECORD_SIZE as usize {
            return Err(RecordCodecError::OversizedRecord {
                len: record.len(),
                max: crate::MAX_RECORD_SIZE as usize,
            });
        }

        dst.reserve(4 + record.len());
        dst.put_u32(record.len() as u32);
        dst.put(record);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_roundtrip() {
        let mut codec = RecordCodec;
        let mut buf = BytesMut::new();

        codec
            .encode(Bytes::from_static(b"first"), &mut buf)
            .unwrap();
        codec
            .encode(Bytes::from_static(b"second"), &mut buf)
            .unwrap();

        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), &b"first"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), &b"second"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_record_partial_input() {
        let mut codec = RecordCodec;
        let mut full = BytesMut::new();
        codec
            .encode(Bytes::from_static(b"payload"), &mut full)
            .unwrap();

        let mut partial = BytesMut::from(&full[..5]);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.extend_from_slice(&full[5..]);
        assert_eq!(codec.decode(&mut partial).unwrap().unwrap(), &b"payload"[..]);
    }

    #[test]
    fn test_record_oversized() {
        let mut codec = RecordCodec;
        let mut buf = BytesMut::new();
        buf.put_u32(crate::MAX_RECORD_SIZE + 1);
        buf.put_slice(b"junk");

        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, RecordCodecError::OversizedRecord { .. }));
    }
}
