//! Agent session lifecycle
//!
//! `AgentSession::start` spawns the connect/serve/reconnect loop and hands
//! back an `AgentHandle` for status polling, log readback, and shutdown.

use crate::config::AgentConfig;
use crate::log::LogBuffer;
use crate::proxy::connect_via_proxy;
use crate::AgentError;
use burrow_mux::{relay, seal_datagram, MuxConfig, MuxConnection, MuxRole, MuxStream, StreamSeal};
use burrow_pipeline::{derive_session_key, Direction, Pipeline};
use burrow_proto::{
    AgentHello, AgentMetadata, AuthRejectReason, AuthReply, Frame, FrameKind, OpenRequest,
    TransportKind, MAX_RECORD_SIZE, PROTOCOL_VERSION,
};
use bytes::Bytes;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Idle cutoff for datagram targets
const UDP_IDLE: Duration = Duration::from_secs(60);

/// Where the session currently stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AgentStatus {
    /// Not running
    Idle = 0,
    Connecting = 1,
    Connected = 2,
    /// Stopped on an unrecoverable failure
    Error = 3,
}

impl AgentStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => AgentStatus::Connecting,
            2 => AgentStatus::Connected,
            3 => AgentStatus::Error,
            _ => AgentStatus::Idle,
        }
    }
}

/// Control surface over a running session
pub struct AgentHandle {
    status: Arc<AtomicU8>,
    log: Arc<LogBuffer>,
    cancel: CancellationToken,
    done: CancellationToken,
}

impl AgentHandle {
    pub fn status(&self) -> AgentStatus {
        AgentStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Recent activity lines, oldest first
    pub fn recent_log(&self) -> Vec<String> {
        self.log.snapshot()
    }

    /// Ask the session to stop; resolves once the loop has exited
    pub async fn stop(&self) {
        self.cancel.cancel();
        self.done.cancelled().await;
    }

    /// Resolves when the session loop exits for any reason
    pub async fn done(&self) {
        self.done.cancelled().await;
    }
}

pub struct AgentSession;

impl AgentSession {
    /// Validate the configuration and spawn the session loop
    pub fn start(config: AgentConfig) -> Result<AgentHandle, AgentError> {
        config.validate()?;

        let status = Arc::new(AtomicU8::new(AgentStatus::Connecting as u8));
        let log = Arc::new(LogBuffer::new());
        let cancel = CancellationToken::new();
        let done = CancellationToken::new();

        let handle = AgentHandle {
            status: status.clone(),
            log: log.clone(),
            cancel: cancel.clone(),
            done: done.clone(),
        };

        tokio::spawn(async move {
            run_loop(config, status, log, cancel).await;
            done.cancel();
        });

        Ok(handle)
    }
}

async fn run_loop(
    config: AgentConfig,
    status: Arc<AtomicU8>,
    log: Arc<LogBuffer>,
    cancel: CancellationToken,
) {
    let mut backoff = config.reconnect.initial();
    let mut attempts = 0u32;

    loop {
        if cancel.is_cancelled() {
            status.store(AgentStatus::Idle as u8, Ordering::Release);
            return;
        }

        status.store(AgentStatus::Connecting as u8, Ordering::Release);
        log.push(format!("connecting to {}", config.server_addr));

        match connect_once(&config).await {
            Ok((mux, key)) => {
                attempts = 0;
                backoff = config.reconnect.initial();
                status.store(AgentStatus::Connected as u8, Ordering::Release);
                log.push("connected");
                info!(server = %config.server_addr, "agent connected");

                serve(mux, key, &cancel, &log).await;

                if cancel.is_cancelled() {
                    log.push("stopped");
                    status.store(AgentStatus::Idle as u8, Ordering::Release);
                    return;
                }
                log.push("connection lost");
                warn!(server = %config.server_addr, "bridge connection lost");
            }
            Err(e @ AgentError::Rejected(AuthRejectReason::BadSecret))
            | Err(e @ AgentError::Rejected(AuthRejectReason::UnsupportedVersion { .. })) => {
                // Retrying cannot fix credentials or a version gap
                log.push(format!("fatal: {}", e));
                warn!("giving up: {}", e);
                status.store(AgentStatus::Error as u8, Ordering::Release);
                return;
            }
            Err(e) => {
                log.push(format!("connect failed: {}", e));
                warn!(server = %config.server_addr, "connect failed: {}", e);
            }
        }

        attempts += 1;
        if let Some(max) = config.reconnect.max_attempts {
            if attempts >= max {
                log.push(format!("giving up after {} attempts", attempts));
                status.store(AgentStatus::Error as u8, Ordering::Release);
                return;
            }
        }

        log.push(format!("retrying in {:?}", backoff));
        tokio::select! {
            _ = cancel.cancelled() => {
                status.store(AgentStatus::Idle as u8, Ordering::Release);
                return;
            }
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(config.reconnect.max());
    }
}

async fn connect_once(config: &AgentConfig) -> Result<(Arc<MuxConnection>, [u8; 32]), AgentError> {
    let mut socket = match &config.proxy_url {
        Some(url) => connect_via_proxy(url, &config.server_addr).await?,
        None => TcpStream::connect(&config.server_addr).await?,
    };

    let reply = match timeout(
        config.handshake_timeout(),
        exchange_hello(&mut socket, config),
    )
    .await
    {
        Ok(result) => result?,
        Err(_) => return Err(AgentError::HandshakeTimeout),
    };

    let session_nonce = match reply {
        AuthReply::Accepted { session_nonce, .. } => session_nonce,
        AuthReply::Rejected { reason } => return Err(AgentError::Rejected(reason)),
    };

    let key = derive_session_key(&config.secret, &session_nonce);
    let outbound = Pipeline::negotiated(config.pipeline, Some(&key), Direction::AgentToBridge)?;
    let inbound = Pipeline::negotiated(config.pipeline, Some(&key), Direction::AgentToBridge)?;

    let mux = Arc::new(MuxConnection::start(
        socket,
        MuxRole::Listener,
        outbound,
        inbound,
        MuxConfig::default(),
    ));
    Ok((mux, key))
}

async fn exchange_hello(
    socket: &mut TcpStream,
    config: &AgentConfig,
) -> Result<AuthReply, AgentError> {
    let hello = AgentHello {
        secret: config.secret.clone(),
        transport: config.transport,
        version: PROTOCOL_VERSION,
        pipeline: config.pipeline,
        metadata: AgentMetadata::default(),
    };
    let payload = hello
        .to_bytes()
        .map_err(|e| AgentError::MalformedReply(e.to_string()))?;
    let frame = Frame::auth(Bytes::from(payload)).encode();

    let mut record = Vec::with_capacity(4 + frame.len());
    record.extend_from_slice(&(frame.len() as u32).to_be_bytes());
    record.extend_from_slice(&frame);
    socket.write_all(&record).await?;

    let mut len_buf = [0u8; 4];
    socket.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_RECORD_SIZE as usize {
        return Err(AgentError::MalformedReply(format!(
            "reply record of {} bytes",
            len
        )));
    }
    let mut buf = vec![0u8; len];
    socket.read_exact(&mut buf).await?;

    let frame =
        Frame::decode(Bytes::from(buf)).map_err(|e| AgentError::MalformedReply(e.to_string()))?;
    if frame.kind != FrameKind::Auth {
        return Err(AgentError::MalformedReply(format!(
            "expected auth frame, got {:?}",
            frame.kind
        )));
    }
    AuthReply::from_bytes(&frame.payload).map_err(|e| AgentError::MalformedReply(e.to_string()))
}

/// Serve stream opens until the connection dies or the session stops
async fn serve(
    mux: Arc<MuxConnection>,
    key: [u8; 32],
    cancel: &CancellationToken,
    log: &Arc<LogBuffer>,
) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => {
                mux.close("agent stopping");
                return;
            }
            accepted = mux.accept() => accepted,
        };
        let Some((request, stream)) = accepted else {
            return;
        };

        let log = log.clone();
        tokio::spawn(async move {
            let target = request.target.clone();
            if let Err(e) = handle_stream(request, stream, key).await {
                log.push(format!("stream to {} ended: {}", target, e));
                debug!(%target, "stream ended: {}", e);
            }
        });
    }
}

async fn handle_stream(
    request: OpenRequest,
    stream: MuxStream,
    key: [u8; 32],
) -> Result<(), AgentError> {
    let seal = StreamSeal::negotiated(
        request.pipeline,
        &key,
        stream.id(),
        Direction::AgentToBridge,
    )?;

    match request.protocol {
        TransportKind::Stream => {
            debug!(target = %request.target, stream_id = stream.id(), "dialing tcp target");
            // Dial failure drops the stream, which resets the public side
            let target = TcpStream::connect(&request.target).await?;
            relay(stream, target, seal).await?;
        }
        TransportKind::Datagram => {
            debug!(target = %request.target, stream_id = stream.id(), "dialing udp target");
            let socket = UdpSocket::bind("0.0.0.0:0").await?;
            socket.connect(&request.target).await?;
            pump_datagrams(stream, socket, seal).await?;
        }
    }
    Ok(())
}

/// Bidirectional datagram pump; one stream chunk is one datagram
async fn pump_datagrams(
    stream: MuxStream,
    socket: UdpSocket,
    seal: StreamSeal,
) -> Result<(), AgentError> {
    let socket = Arc::new(socket);
    let (mut reader, mut writer) = stream.split();
    let (mut seal_half, mut open_half) = seal.into_halves();

    let to_target = {
        let socket = socket.clone();
        async move {
            while let Some(chunk) = reader.recv().await {
                let payload = match &mut open_half {
                    Some(pipeline) => pipeline.open(chunk)?,
                    None => chunk,
                };
                socket.send(&payload).await?;
            }
            Ok::<(), AgentError>(())
        }
    };

    let from_target = async move {
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = match timeout(UDP_IDLE, socket.recv(&mut buf)).await {
                Ok(result) => result?,
                Err(_) => break,
            };
            let datagram = Bytes::copy_from_slice(&buf[..n]);
            match seal_datagram(&mut seal_half, datagram, writer.max_frame_payload())? {
                Some(payload) => writer.send(&payload).await?,
                // One datagram must stay one frame; too big to fit
                None => debug!(stream_id = writer.id(), "oversized datagram dropped"),
            }
        }
        writer.close().await;
        Ok::<(), AgentError>(())
    };

    tokio::try_join!(to_target, from_target)?;
    Ok(())
}
