//! Bidirectional pumping between a logical stream and a socket
//!
//! Both the bridge dispatchers and the agent use the same loop: bytes from
//! the socket go into the stream, bytes from the stream go back out, until
//! either side reaches EOF or fails.
//!
//! Tunnels can layer their own pipeline on stream payloads. Sealed payloads
//! need their own length framing because the multiplexer is free to split
//! large sends across data frames; each sealed record travels as a u32
//! length prefix plus the sealed bytes, keyed by a per-stream subkey.

use crate::stream::{MuxStream, MuxStreamReader, MuxStreamWriter};
use crate::MuxError;
use burrow_pipeline::{derive_stream_key, Direction, Pipeline, PipelineError, PipelineMode};
use bytes::{Buf, Bytes, BytesMut};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::trace;

/// Socket read size per iteration
const READ_CHUNK: usize = 16 * 1024;

/// Upper bound on one sealed stream record
const MAX_SEALED_RECORD: usize = burrow_proto::MAX_FRAME_SIZE as usize;

/// Headroom reserved for zlib framing plus the AEAD tag when bounding a
/// datagram against the frame size
const SEAL_OVERHEAD: usize = 256;

/// Optional per-stream payload transform used by [`relay`]
pub struct StreamSeal {
    state: Option<SealState>,
}

struct SealState {
    seal: Pipeline,
    open: Pipeline,
}

impl StreamSeal {
    /// Payloads pass through untouched
    pub fn plain() -> Self {
        Self { state: None }
    }

    /// Build the transform for one end of a stream.
    ///
    /// `send_dir` is the direction this side writes in. Both ends derive the
    /// same subkey from the session key and the stream id.
    pub fn negotiated(
        mode: PipelineMode,
        session_key: &[u8; 32],
        stream_id: u32,
        send_dir: Direction,
    ) -> Result<Self, PipelineError> {
        if mode == PipelineMode::None {
            return Ok(Self::plain());
        }

        let stream_key = derive_stream_key(session_key, stream_id);
        Ok(Self {
            state: Some(SealState {
                seal: Pipeline::negotiated(mode, Some(&stream_key), send_dir)?,
                open: Pipeline::negotiated(mode, Some(&stream_key), send_dir)?,
            }),
        })
    }

    /// Break into the sealing and opening pipelines so datagram pumps can
    /// run the two directions in separate tasks. Datagram flows seal each
    /// payload as one self-contained record and skip the length framing,
    /// since every payload travels as exactly one data frame.
    pub fn into_halves(self) -> (Option<Pipeline>, Option<Pipeline>) {
        match self.state {
            Some(state) => (Some(state.seal), Some(state.open)),
            None => (None, None),
        }
    }
}

/// Plaintext bytes moved in each direction by a finished relay
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Socket to stream
    pub bytes_in: u64,
    /// Stream to socket
    pub bytes_out: u64,
}

/// Pump bytes both ways until EOF on either side.
///
/// A clean EOF from the socket half-closes the stream; a stream EOF shuts
/// down the socket's write side. The first error aborts both directions and
/// resets the stream.
pub async fn relay<T>(stream: MuxStream, io: T, seal: StreamSeal) -> Result<RelayStats, MuxError>
where
    T: AsyncRead + AsyncWrite,
{
    run_relay(stream, io, seal, None, None).await
}

/// [`relay`], but `initial` bytes already read from the socket (a parsed
/// request head, for instance) are sent down the stream first
pub async fn relay_with_initial<T>(
    stream: MuxStream,
    io: T,
    seal: StreamSeal,
    initial: Option<Bytes>,
) -> Result<RelayStats, MuxError>
where
    T: AsyncRead + AsyncWrite,
{
    run_relay(stream, io, seal, initial, None).await
}

/// [`relay_with_initial`] with an inactivity cutoff: a direction that moves
/// no bytes for `idle` is wound down cleanly instead of pumping forever
pub async fn relay_with_idle<T>(
    stream: MuxStream,
    io: T,
    seal: StreamSeal,
    initial: Option<Bytes>,
    idle: Duration,
) -> Result<RelayStats, MuxError>
where
    T: AsyncRead + AsyncWrite,
{
    run_relay(stream, io, seal, initial, Some(idle)).await
}

async fn run_relay<T>(
    stream: MuxStream,
    io: T,
    seal: StreamSeal,
    initial: Option<Bytes>,
    idle: Option<Duration>,
) -> Result<RelayStats, MuxError>
where
    T: AsyncRead + AsyncWrite,
{
    let (reader, writer) = stream.split();
    let (io_read, io_write) = tokio::io::split(io);

    let (seal_half, open_half) = seal.into_halves();

    let (bytes_in, bytes_out) = tokio::try_join!(
        pump_in(io_read, writer, seal_half, initial, idle),
        pump_out(reader, io_write, open_half, idle),
    )?;

    Ok(RelayStats {
        bytes_in,
        bytes_out,
    })
}

/// Seal one datagram for a datagram flow.
///
/// A sealed payload must stay within a single data frame or the receiver's
/// per-datagram `open` sees a fragment. Datagrams that cannot fit once the
/// seal headroom is added return `None` before the pipeline counter
/// advances, so the caller can drop them without desynchronizing the
/// cipher; UDP semantics permit the drop.
pub fn seal_datagram(
    seal: &mut Option<Pipeline>,
    datagram: Bytes,
    max_frame: usize,
) -> Result<Option<Bytes>, PipelineError> {
    match seal {
        Some(pipeline) => {
            if datagram.len() + SEAL_OVERHEAD > max_frame {
                return Ok(None);
            }
            Ok(Some(pipeline.seal(datagram)?))
        }
        None => {
            if datagram.len() > max_frame {
                return Ok(None);
            }
            Ok(Some(datagram))
        }
    }
}

async fn pump_in<R>(
    mut io: R,
    mut writer: MuxStreamWriter,
    mut seal: Option<Pipeline>,
    initial: Option<Bytes>,
    idle: Option<Duration>,
) -> Result<u64, MuxError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK];
    let mut total = 0u64;

    if let Some(head) = initial {
        total += head.len() as u64;
        send_payload(&mut writer, &mut seal, &head).await?;
    }

    loop {
        let n = match idle {
            Some(limit) => match timeout(limit, io.read(&mut buf)).await {
                Ok(result) => result?,
                Err(_) => {
                    trace!(stream_id = writer.id(), total, "socket idle, half-closing");
                    writer.close().await;
                    return Ok(total);
                }
            },
            None => io.read(&mut buf).await?,
        };
        if n == 0 {
            trace!(stream_id = writer.id(), total, "socket eof, half-closing");
            writer.close().await;
            return Ok(total);
        }
        total += n as u64;
        send_payload(&mut writer, &mut seal, &buf[..n]).await?;
    }
}

async fn send_payload(
    writer: &mut MuxStreamWriter,
    seal: &mut Option<Pipeline>,
    data: &[u8],
) -> Result<(), MuxError> {
    match seal {
        Some(pipeline) => {
            let sealed = pipeline.seal(bytes::Bytes::copy_from_slice(data))?;
            let mut framed = Vec::with_capacity(4 + sealed.len());
            framed.extend_from_slice(&(sealed.len() as u32).to_be_bytes());
            framed.extend_from_slice(&sealed);
            writer.send(&framed).await
        }
        None => writer.send(data).await,
    }
}

async fn pump_out<W>(
    mut reader: MuxStreamReader,
    mut io: W,
    mut open: Option<Pipeline>,
    idle: Option<Duration>,
) -> Result<u64, MuxError>
where
    W: AsyncWrite + Unpin,
{
    let mut pending = BytesMut::new();
    let mut total = 0u64;

    loop {
        let received = match idle {
            Some(limit) => match timeout(limit, reader.recv()).await {
                Ok(received) => received,
                Err(_) => {
                    trace!(stream_id = reader.id(), total, "stream idle, shutting down socket");
                    let _ = io.shutdown().await;
                    return Ok(total);
                }
            },
            None => reader.recv().await,
        };
        let Some(chunk) = received else {
            break;
        };
        match &mut open {
            Some(pipeline) => {
                pending.extend_from_slice(&chunk);
                while pending.len() >= 4 {
                    let len = u32::from_be_bytes([
                        pending[0], pending[1], pending[2], pending[3],
                    ]) as usize;
                    if len > MAX_SEALED_RECORD {
                        return Err(MuxError::ProtocolViolation(
                            "oversized sealed stream record",
                        ));
                    }
                    if pending.len() < 4 + len {
                        break;
                    }
                    pending.advance(4);
                    let record = pending.split_to(len).freeze();
                    let plain = pipeline.open(record)?;
                    total += plain.len() as u64;
                    io.write_all(&plain).await?;
                }
            }
            None => {
                total += chunk.len() as u64;
                io.write_all(&chunk).await?;
            }
        }
    }

    // Sealed mode only ever buffers whole-record remainders; leftover bytes
    // at EOF mean the peer cut a record short
    if !pending.is_empty() {
        return Err(MuxError::ProtocolViolation("truncated sealed stream record"));
    }

    trace!(stream_id = reader.id(), total, "stream eof, shutting down socket");
    let _ = io.shutdown().await;
    Ok(total)
}
