//! Physical connection driver
//!
//! One reader task and one writer task per physical connection. The writer
//! owns the outbound pipeline and socket half; everything that wants to emit
//! a frame goes through one mpsc channel, which is also what serializes
//! per-stream frame order.

use crate::stream::MuxStream;
use crate::{MuxConfig, MuxError, StreamState};
use burrow_pipeline::Pipeline;
use burrow_proto::{Frame, FrameFlags, FrameKind, OpenRequest, RecordCodec, StreamId};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Which side of the connection this multiplexer drives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuxRole {
    /// Opens logical streams (the bridge side)
    Dialer,
    /// Accepts logical streams (the agent side)
    Listener,
}

pub(crate) struct StreamEntry {
    pub(crate) state: StreamState,
    /// Inbound data to the consumer; dropped on remote close for EOF
    recv_tx: Option<mpsc::UnboundedSender<Bytes>>,
    /// Byte permits the peer has granted us for sending
    send_window: Arc<Semaphore>,
    /// Bytes the peer may still send before we credit the window back
    recv_budget: u32,
}

pub(crate) struct ConnInner {
    pub(crate) config: MuxConfig,
    role: MuxRole,
    streams: Mutex<HashMap<StreamId, StreamEntry>>,
    next_stream_id: AtomicU32,
    pending_opens: Mutex<HashMap<StreamId, oneshot::Sender<()>>>,
    pub(crate) frame_tx: mpsc::Sender<Frame>,
    pub(crate) shutdown: CancellationToken,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    started: Instant,
    last_pong_ms: AtomicU64,
    close_reason: Mutex<Option<String>>,
}

impl ConnInner {
    fn now_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    /// Force the connection down; idempotent. Every stream is released so no
    /// task stays blocked past the connection's lifetime.
    pub(crate) fn teardown(&self, reason: &str) {
        {
            let mut stored = self.close_reason.lock().unwrap();
            if stored.is_some() {
                return;
            }
            *stored = Some(reason.to_string());
        }

        debug!(reason, "physical connection torn down");

        let mut streams = self.streams.lock().unwrap();
        for (_, entry) in streams.iter_mut() {
            entry.state = StreamState::Closed;
            entry.recv_tx = None;
            entry.send_window.close();
        }
        streams.clear();

        self.pending_opens.lock().unwrap().clear();
        self.shutdown.cancel();
    }

    pub(crate) fn close_reason(&self) -> String {
        self.close_reason
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| "closing".to_string())
    }

    fn remove_entry(&self, id: StreamId) {
        let mut streams = self.streams.lock().unwrap();
        if let Some(mut entry) = streams.remove(&id) {
            entry.state = StreamState::Closed;
            entry.recv_tx = None;
            entry.send_window.close();
        }
    }

    /// Local side signalled close (FIN sent). Returns true when the entry is
    /// fully closed and gone.
    pub(crate) fn on_local_close(&self, id: StreamId) -> bool {
        let remove = {
            let mut streams = self.streams.lock().unwrap();
            match streams.get_mut(&id) {
                Some(entry) => match entry.state {
                    StreamState::HalfClosedRemote | StreamState::Opening => true,
                    _ => {
                        entry.state = StreamState::HalfClosedLocal;
                        false
                    }
                },
                None => return true,
            }
        };

        if remove {
            self.remove_entry(id);
        }
        remove
    }

    /// Peer signalled close for a stream
    fn on_remote_close(&self, id: StreamId, rst: bool) {
        if rst {
            self.remove_entry(id);
            return;
        }

        let remove = {
            let mut streams = self.streams.lock().unwrap();
            match streams.get_mut(&id) {
                Some(entry) => match entry.state {
                    StreamState::HalfClosedLocal => true,
                    _ => {
                        entry.state = StreamState::HalfClosedRemote;
                        // EOF to the consumer once buffered data is drained
                        entry.recv_tx = None;
                        false
                    }
                },
                None => false,
            }
        };

        if remove {
            self.remove_entry(id);
        }
    }

    /// Consumer drained `n` bytes; widen the budget the peer sees
    pub(crate) fn credit_recv(&self, id: StreamId, n: u32) {
        let mut streams = self.streams.lock().unwrap();
        if let Some(entry) = streams.get_mut(&id) {
            entry.recv_budget = entry.recv_budget.saturating_add(n);
        }
    }

    pub(crate) fn forget_stream(&self, id: StreamId) {
        self.remove_entry(id);
    }

    pub(crate) fn stream_state(&self, id: StreamId) -> Option<StreamState> {
        self.streams.lock().unwrap().get(&id).map(|e| e.state)
    }

    fn active_streams(&self) -> usize {
        self.streams.lock().unwrap().len()
    }
}

/// Handle to a running multiplexed physical connection
pub struct MuxConnection {
    inner: Arc<ConnInner>,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<(OpenRequest, MuxStream)>>,
}

impl MuxConnection {
    /// Take over `io` and start the reader/writer/heartbeat tasks.
    ///
    /// `outbound` seals records this side writes; `inbound` opens records
    /// from the peer. Both must be built from the same negotiated mode and
    /// session key.
    pub fn start<T>(
        io: T,
        role: MuxRole,
        outbound: Pipeline,
        inbound: Pipeline,
        config: MuxConfig,
    ) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(io);
        let (frame_tx, frame_rx) = mpsc::channel::<Frame>(64);
        let (accept_tx, accept_rx) = mpsc::channel(config.accept_backlog);

        let inner = Arc::new(ConnInner {
            config,
            role,
            streams: Mutex::new(HashMap::new()),
            // Stream 0 is the control plane
            next_stream_id: AtomicU32::new(1),
            pending_opens: Mutex::new(HashMap::new()),
            frame_tx,
            shutdown: CancellationToken::new(),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            started: Instant::now(),
            last_pong_ms: AtomicU64::new(0),
            close_reason: Mutex::new(None),
        });

        tokio::spawn(run_writer(
            inner.clone(),
            FramedWrite::new(write_half, RecordCodec),
            outbound,
            frame_rx,
        ));
        tokio::spawn(run_reader(
            inner.clone(),
            FramedRead::new(read_half, RecordCodec),
            inbound,
            accept_tx,
        ));
        tokio::spawn(run_heartbeat(inner.clone()));

        Self {
            inner,
            accept_rx: tokio::sync::Mutex::new(accept_rx),
        }
    }

    pub fn role(&self) -> MuxRole {
        self.inner.role
    }

    /// Open a logical stream to the peer and wait for its acknowledgement
    pub async fn open_stream(&self, request: &OpenRequest) -> Result<MuxStream, MuxError> {
        if self.inner.role != MuxRole::Dialer {
            return Err(MuxError::NotDialer);
        }
        if self.inner.shutdown.is_cancelled() {
            return Err(MuxError::ConnectionClosed(self.inner.close_reason()));
        }

        let id = self.inner.next_stream_id.fetch_add(1, Ordering::SeqCst);
        let (recv_tx, recv_rx) = mpsc::unbounded_channel();
        let send_window = Arc::new(Semaphore::new(self.inner.config.initial_window as usize));

        self.inner.streams.lock().unwrap().insert(
            id,
            StreamEntry {
                state: StreamState::Opening,
                recv_tx: Some(recv_tx),
                send_window: send_window.clone(),
                recv_budget: self.inner.config.initial_window,
            },
        );

        let (ack_tx, ack_rx) = oneshot::channel();
        self.inner.pending_opens.lock().unwrap().insert(id, ack_tx);

        let payload = Bytes::from(request.to_bytes()?);
        if self
            .inner
            .frame_tx
            .send(Frame::open(id, payload))
            .await
            .is_err()
        {
            self.inner.pending_opens.lock().unwrap().remove(&id);
            self.inner.forget_stream(id);
            return Err(MuxError::ConnectionClosed(self.inner.close_reason()));
        }

        match timeout(self.inner.config.open_timeout, ack_rx).await {
            Ok(Ok(())) => {
                if let Some(entry) = self.inner.streams.lock().unwrap().get_mut(&id) {
                    entry.state = StreamState::Open;
                }
                trace!(stream_id = id, "stream opened");
                Ok(MuxStream::new(id, self.inner.clone(), recv_rx, send_window))
            }
            Ok(Err(_)) => {
                // Sender dropped in teardown
                self.inner.forget_stream(id);
                Err(MuxError::ConnectionClosed(self.inner.close_reason()))
            }
            Err(_) => {
                self.inner.pending_opens.lock().unwrap().remove(&id);
                self.inner.forget_stream(id);
                let rst = Frame::close(id).with_flags(FrameFlags::new().with_rst());
                let _ = self.inner.frame_tx.try_send(rst);
                Err(MuxError::StreamTimeout)
            }
        }
    }

    /// Wait for the peer to open a stream. Returns `None` once the physical
    /// connection is closed.
    pub async fn accept(&self) -> Option<(OpenRequest, MuxStream)> {
        self.accept_rx.lock().await.recv().await
    }

    /// Explicitly fail the connection, cascading to all streams
    pub fn close(&self, reason: &str) {
        self.inner.teardown(reason);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Resolves when the physical connection has died (any cause)
    pub async fn closed(&self) {
        self.inner.shutdown.cancelled().await;
    }

    /// Milliseconds since the last pong was heard
    pub fn last_pong_age_ms(&self) -> u64 {
        self.inner
            .now_ms()
            .saturating_sub(self.inner.last_pong_ms.load(Ordering::Relaxed))
    }

    /// Drain the (bytes_in, bytes_out) counters accumulated since last call
    pub fn take_traffic(&self) -> (u64, u64) {
        (
            self.inner.bytes_in.swap(0, Ordering::Relaxed),
            self.inner.bytes_out.swap(0, Ordering::Relaxed),
        )
    }

    pub fn active_streams(&self) -> usize {
        self.inner.active_streams()
    }
}

impl Drop for MuxConnection {
    fn drop(&mut self) {
        self.inner.teardown("connection handle dropped");
    }
}

async fn run_writer<W>(
    inner: Arc<ConnInner>,
    mut sink: FramedWrite<W, RecordCodec>,
    mut outbound: Pipeline,
    mut frame_rx: mpsc::Receiver<Frame>,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let frame = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            frame = frame_rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        if frame.kind == FrameKind::Data {
            inner
                .bytes_out
                .fetch_add(frame.payload.len() as u64, Ordering::Relaxed);
        }

        let record = match outbound.seal(frame.encode()) {
            Ok(record) => record,
            Err(e) => {
                inner.teardown(&format!("outbound pipeline failed: {}", e));
                break;
            }
        };

        if let Err(e) = sink.send(record).await {
            inner.teardown(&format!("write failed: {}", e));
            break;
        }
    }

    // Best-effort flush of anything already queued in the sink
    let _ = sink.close().await;
}

async fn run_reader<R>(
    inner: Arc<ConnInner>,
    mut source: FramedRead<R, RecordCodec>,
    mut inbound: Pipeline,
    accept_tx: mpsc::Sender<(OpenRequest, MuxStream)>,
) where
    R: AsyncRead + Unpin,
{
    loop {
        let record = tokio::select! {
            _ = inner.shutdown.cancelled() => return,
            record = source.next() => record,
        };

        let record = match record {
            Some(Ok(record)) => record,
            Some(Err(e)) => {
                inner.teardown(&format!("{}", e));
                return;
            }
            None => {
                inner.teardown("connection closed by peer");
                return;
            }
        };

        let frame_bytes = match inbound.open(record) {
            Ok(bytes) => bytes,
            Err(e) => {
                inner.teardown(&format!("{}", e));
                return;
            }
        };

        let frame = match Frame::decode(frame_bytes) {
            Ok(frame) => frame,
            Err(e) => {
                inner.teardown(&format!("{}", e));
                return;
            }
        };

        if let Err(e) = handle_frame(&inner, &accept_tx, frame).await {
            inner.teardown(&format!("{}", e));
            return;
        }
    }
}

/// Dispatch one inbound frame. `Err` means the whole connection is poisoned;
/// stream-local trouble is handled inline with a reset of that stream.
async fn handle_frame(
    inner: &Arc<ConnInner>,
    accept_tx: &mpsc::Sender<(OpenRequest, MuxStream)>,
    frame: Frame,
) -> Result<(), MuxError> {
    match frame.kind {
        FrameKind::Auth => Err(MuxError::ProtocolViolation(
            "auth frame after handshake completed",
        )),

        FrameKind::Open if frame.flags.has_ack() => {
            let pending = inner.pending_opens.lock().unwrap().remove(&frame.stream_id);
            match pending {
                Some(ack_tx) => {
                    let _ = ack_tx.send(());
                }
                None => {
                    // Open already timed out locally; tell the peer to forget it
                    let rst =
                        Frame::close(frame.stream_id).with_flags(FrameFlags::new().with_rst());
                    let _ = inner.frame_tx.send(rst).await;
                }
            }
            Ok(())
        }

        FrameKind::Open => {
            if inner.role == MuxRole::Dialer {
                warn!(stream_id = frame.stream_id, "listener tried to open a stream");
                let rst = Frame::close(frame.stream_id).with_flags(FrameFlags::new().with_rst());
                let _ = inner.frame_tx.send(rst).await;
                return Ok(());
            }

            // A garbage open payload poisons the shared link
            let request = OpenRequest::from_bytes(&frame.payload)?;

            let (recv_tx, recv_rx) = mpsc::unbounded_channel();
            let send_window = Arc::new(Semaphore::new(inner.config.initial_window as usize));
            inner.streams.lock().unwrap().insert(
                frame.stream_id,
                StreamEntry {
                    state: StreamState::Open,
                    recv_tx: Some(recv_tx),
                    send_window: send_window.clone(),
                    recv_budget: inner.config.initial_window,
                },
            );

            let stream = MuxStream::new(
                frame.stream_id,
                inner.clone(),
                recv_rx,
                send_window,
            );

            let ack = Frame::open(frame.stream_id, Bytes::new())
                .with_flags(FrameFlags::new().with_ack());
            if inner.frame_tx.send(ack).await.is_err() {
                return Ok(());
            }

            if let Err(e) = accept_tx.try_send((request, stream)) {
                warn!(
                    stream_id = frame.stream_id,
                    "accept backlog full, resetting stream"
                );
                drop(e);
                inner.forget_stream(frame.stream_id);
                let rst = Frame::close(frame.stream_id).with_flags(FrameFlags::new().with_rst());
                let _ = inner.frame_tx.send(rst).await;
            }
            Ok(())
        }

        FrameKind::Data => {
            let len = frame.payload.len() as u32;
            inner.bytes_in.fetch_add(len as u64, Ordering::Relaxed);

            let overrun = {
                let mut streams = inner.streams.lock().unwrap();
                match streams.get_mut(&frame.stream_id) {
                    Some(entry) => {
                        if entry.recv_budget < len {
                            true
                        } else {
                            entry.recv_budget -= len;
                            if let Some(tx) = &entry.recv_tx {
                                // Consumer gone: data is discarded, credit on drop
                                let _ = tx.send(frame.payload.clone());
                            }
                            false
                        }
                    }
                    // Frames racing a close are dropped silently
                    None => {
                        trace!(stream_id = frame.stream_id, "data for unknown stream dropped");
                        false
                    }
                }
            };

            if overrun {
                warn!(
                    stream_id = frame.stream_id,
                    "{}",
                    MuxError::FlowControlViolation(frame.stream_id)
                );
                inner.forget_stream(frame.stream_id);
                let rst = Frame::close(frame.stream_id).with_flags(FrameFlags::new().with_rst());
                let _ = inner.frame_tx.send(rst).await;
                return Ok(());
            }

            if frame.flags.has_fin() {
                inner.on_remote_close(frame.stream_id, false);
            }
            Ok(())
        }

        FrameKind::WindowUpdate => {
            let credit = frame.window_credit()?;
            let streams = inner.streams.lock().unwrap();
            if let Some(entry) = streams.get(&frame.stream_id) {
                entry.send_window.add_permits(credit as usize);
            }
            Ok(())
        }

        FrameKind::Close => {
            inner.on_remote_close(frame.stream_id, frame.flags.has_rst());
            Ok(())
        }

        FrameKind::Ping => {
            let ts = frame.timestamp_ms()?;
            let _ = inner.frame_tx.send(Frame::pong(ts)).await;
            Ok(())
        }

        FrameKind::Pong => {
            // Payload checked for shape even though the echo is unused
            frame.timestamp_ms()?;
            inner
                .last_pong_ms
                .store(inner.now_ms(), Ordering::Relaxed);
            Ok(())
        }
    }
}

async fn run_heartbeat(inner: Arc<ConnInner>) {
    let interval = inner.config.heartbeat_interval;
    let deadline = interval * inner.config.heartbeat_misses;
    inner
        .last_pong_ms
        .store(inner.now_ms(), Ordering::Relaxed);

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // First tick fires immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let silent_ms = inner
            .now_ms()
            .saturating_sub(inner.last_pong_ms.load(Ordering::Relaxed));
        if silent_ms > deadline.as_millis() as u64 {
            inner.teardown(&format!("{}", MuxError::HeartbeatTimeout));
            return;
        }

        if inner.frame_tx.send(Frame::ping(inner.now_ms())).await.is_err() {
            return;
        }
    }
}
