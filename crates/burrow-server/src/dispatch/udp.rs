//! Public UDP endpoint
//!
//! One socket per udp tunnel port. Each distinct source address is one flow
//! with its own logical stream; payloads at or below the data-frame size
//! travel as single frames, so datagram boundaries survive the tunnel.
//! Flows idle past the configured timeout are reaped.

use crate::session::ConnectionManager;
use crate::ServerError;
use burrow_mux::{seal_datagram, MuxStream, StreamSeal};
use burrow_registry::TunnelRegistry;
use bytes::Bytes;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Datagrams queued per flow before the listener starts dropping
const FLOW_BACKLOG: usize = 64;

pub struct UdpDispatcher {
    pub port: u16,
    pub tunnels: Arc<TunnelRegistry>,
    pub manager: Arc<ConnectionManager>,
    pub idle: Duration,
}

impl UdpDispatcher {
    pub async fn run(self, cancel: CancellationToken) -> Result<(), ServerError> {
        let socket = Arc::new(UdpSocket::bind(("0.0.0.0", self.port)).await.map_err(
            |e| ServerError::Bind {
                addr: format!("0.0.0.0:{}", self.port),
                reason: e.to_string(),
            },
        )?);
        info!(port = self.port, "udp endpoint listening");

        let flows: Arc<DashMap<SocketAddr, mpsc::Sender<Bytes>>> = Arc::new(DashMap::new());
        let mut buf = vec![0u8; 64 * 1024];

        loop {
            let (n, src) = tokio::select! {
                _ = cancel.cancelled() => {
                    info!(port = self.port, "udp endpoint draining");
                    return Ok(());
                }
                received = socket.recv_from(&mut buf) => received?,
            };
            let datagram = Bytes::copy_from_slice(&buf[..n]);

            if let Some(flow) = flows.get(&src) {
                // A full queue means the agent side is not keeping up; UDP
                // semantics let us drop the datagram
                if flow.try_send(datagram).is_err() {
                    debug!(port = self.port, %src, "flow backlog full, datagram dropped");
                }
                continue;
            }

            let tunnel = match self.tunnels.resolve_udp(self.port) {
                Ok(t) => t,
                Err(e) => {
                    debug!(port = self.port, %src, "refusing flow: {}", e);
                    continue;
                }
            };
            if !tunnel.access.permits_socket(&src) {
                debug!(tunnel_id = %tunnel.id, %src, "source address denied");
                continue;
            }

            let (stream, seal) = match self.manager.open_tunnel_stream(&tunnel).await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(tunnel_id = %tunnel.id, %src, "cannot reach agent: {}", e);
                    continue;
                }
            };

            debug!(tunnel_id = %tunnel.id, %src, stream_id = stream.id(), "udp flow opened");
            let (tx, rx) = mpsc::channel(FLOW_BACKLOG);
            let _ = tx.send(datagram).await;
            flows.insert(src, tx);

            let flows = flows.clone();
            let socket = socket.clone();
            let idle = self.idle;
            let tunnel_id = tunnel.id.clone();
            let drain = cancel.child_token();
            tokio::spawn(async move {
                // Tunnel removal cancels the port token; live flows are
                // dropped with it
                tokio::select! {
                    _ = drain.cancelled() => {
                        debug!(tunnel_id = %tunnel_id, %src, "udp flow drained");
                    }
                    result = run_flow(stream, seal, rx, socket, src, idle) => {
                        if let Err(e) = result {
                            debug!(tunnel_id = %tunnel_id, %src, "udp flow ended: {}", e);
                        }
                    }
                }
                flows.remove(&src);
            });
        }
    }
}

async fn run_flow(
    stream: MuxStream,
    seal: StreamSeal,
    mut rx: mpsc::Receiver<Bytes>,
    socket: Arc<UdpSocket>,
    src: SocketAddr,
    idle: Duration,
) -> Result<(), ServerError> {
    let (mut reader, mut writer) = stream.split();
    let (mut seal_half, mut open_half) = seal.into_halves();

    let inbound = async move {
        loop {
            match timeout(idle, rx.recv()).await {
                Ok(Some(datagram)) => {
                    match seal_datagram(&mut seal_half, datagram, writer.max_frame_payload())? {
                        Some(payload) => writer.send(&payload).await?,
                        // One datagram must stay one frame; too big to fit
                        None => debug!(stream_id = writer.id(), %src, "oversized datagram dropped"),
                    }
                }
                // Channel gone or flow idle: either way the flow is done
                Ok(None) | Err(_) => break,
            }
        }
        writer.close().await;
        Ok::<(), ServerError>(())
    };

    let outbound = async move {
        while let Some(chunk) = reader.recv().await {
            let payload = match &mut open_half {
                Some(pipeline) => pipeline.open(chunk)?,
                None => chunk,
            };
            socket.send_to(&payload, src).await?;
        }
        Ok::<(), ServerError>(())
    };

    tokio::try_join!(inbound, outbound)?;
    Ok(())
}
