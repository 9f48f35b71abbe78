//! Logical stream handle
//!
//! One `MuxStream` is one multiplexed virtual connection inside a physical
//! bridge connection. Payloads at or below the configured data-frame size
//! are delivered as single `recv` chunks, which preserves datagram
//! boundaries for UDP tunnels.
//!
//! Relay loops split a stream into a read half and a write half so the two
//! directions can be pumped by separate tasks. Stream teardown runs when the
//! last half is dropped.

use crate::connection::ConnInner;
use crate::MuxError;
use burrow_proto::{Frame, FrameFlags, StreamId};
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};

/// Shared teardown state for a stream and its split halves
struct StreamGuard {
    id: StreamId,
    inner: Arc<ConnInner>,
    sent_fin: AtomicBool,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        // Dropping without close() is an abort: reset the peer's side so its
        // relay tasks unblock
        if self.inner.stream_state(self.id).is_some() {
            self.inner.forget_stream(self.id);
            if !self.sent_fin.load(Ordering::Acquire) {
                let rst = Frame::close(self.id).with_flags(FrameFlags::new().with_rst());
                let _ = self.inner.frame_tx.try_send(rst);
            }
        }
    }
}

pub struct MuxStream {
    reader: MuxStreamReader,
    writer: MuxStreamWriter,
}

impl MuxStream {
    pub(crate) fn new(
        id: StreamId,
        inner: Arc<ConnInner>,
        recv_rx: mpsc::UnboundedReceiver<Bytes>,
        send_window: Arc<Semaphore>,
    ) -> Self {
        let guard = Arc::new(StreamGuard {
            id,
            inner,
            sent_fin: AtomicBool::new(false),
        });
        Self {
            reader: MuxStreamReader {
                guard: guard.clone(),
                recv_rx,
            },
            writer: MuxStreamWriter { guard, send_window },
        }
    }

    pub fn id(&self) -> StreamId {
        self.writer.guard.id
    }

    /// Send payload bytes, blocking while the peer's advertised window is
    /// exhausted. Closing the stream or its connection unblocks the wait.
    pub async fn send(&mut self, data: &[u8]) -> Result<(), MuxError> {
        self.writer.send(data).await
    }

    /// Receive the next chunk of payload bytes in sender order.
    ///
    /// Returns `None` at EOF: the peer half-closed, reset, or the physical
    /// connection died. Draining a chunk credits the peer's flow window.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.reader.recv().await
    }

    /// Signal that this side is done sending (graceful half-close)
    pub async fn close(&mut self) {
        self.writer.close().await
    }

    /// Split into independently owned read and write halves
    pub fn split(self) -> (MuxStreamReader, MuxStreamWriter) {
        (self.reader, self.writer)
    }
}

impl std::fmt::Debug for MuxStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxStream")
            .field("id", &self.writer.guard.id)
            .finish()
    }
}

/// Receiving half of a split stream
pub struct MuxStreamReader {
    guard: Arc<StreamGuard>,
    recv_rx: mpsc::UnboundedReceiver<Bytes>,
}

impl MuxStreamReader {
    pub fn id(&self) -> StreamId {
        self.guard.id
    }

    pub async fn recv(&mut self) -> Option<Bytes> {
        let data = self.recv_rx.recv().await?;
        let inner = &self.guard.inner;

        let credit = data.len() as u32;
        inner.credit_recv(self.guard.id, credit);
        // Best effort: if the connection is going down the credit is moot
        let _ = inner
            .frame_tx
            .send(Frame::window_update(self.guard.id, credit))
            .await;

        Some(data)
    }
}

/// Sending half of a split stream
pub struct MuxStreamWriter {
    guard: Arc<StreamGuard>,
    send_window: Arc<Semaphore>,
}

impl MuxStreamWriter {
    pub fn id(&self) -> StreamId {
        self.guard.id
    }

    /// Largest payload this connection carries as a single data frame
    pub fn max_frame_payload(&self) -> usize {
        self.guard.inner.config.max_data_frame
    }

    pub async fn send(&mut self, data: &[u8]) -> Result<(), MuxError> {
        let id = self.guard.id;
        if self.guard.sent_fin.load(Ordering::Acquire) {
            return Err(MuxError::StreamClosed(id));
        }

        let inner = &self.guard.inner;
        for chunk in data.chunks(inner.config.max_data_frame) {
            let permits = self
                .send_window
                .acquire_many(chunk.len() as u32)
                .await
                .map_err(|_| MuxError::StreamClosed(id))?;
            // Credit is returned by the peer's window updates, not released
            permits.forget();

            inner
                .frame_tx
                .send(Frame::data(id, Bytes::copy_from_slice(chunk)))
                .await
                .map_err(|_| MuxError::ConnectionClosed(inner.close_reason()))?;
        }

        Ok(())
    }

    pub async fn close(&mut self) {
        if self.guard.sent_fin.swap(true, Ordering::AcqRel) {
            return;
        }

        let id = self.guard.id;
        let _ = self.guard.inner.frame_tx.send(Frame::close(id)).await;
        self.guard.inner.on_local_close(id);
    }
}
