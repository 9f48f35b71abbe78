//! Bridge listener
//!
//! Accepts the outbound connections agents dial in, runs the plaintext
//! handshake, upgrades the connection to the negotiated pipeline, and hands
//! the multiplexed session to the connection manager. A monitor task per
//! session keeps the agent registry's traffic and liveness state current.

use crate::config::ServerConfig;
use crate::session::{AgentSession, ConnectionManager};
use crate::ServerError;
use burrow_mux::{MuxConnection, MuxRole};
use burrow_pipeline::{derive_session_key, Direction, Pipeline};
use burrow_proto::{
    AgentHello, AuthRejectReason, AuthReply, Frame, FrameKind, MAX_RECORD_SIZE, PROTOCOL_VERSION,
};
use burrow_registry::{AgentRegistry, RegistryError};
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// How often session monitors sync traffic and liveness into the registry
const MONITOR_INTERVAL: Duration = Duration::from_secs(5);

pub struct BridgeServer {
    config: ServerConfig,
    agents: Arc<AgentRegistry>,
    manager: Arc<ConnectionManager>,
}

impl BridgeServer {
    pub fn new(
        config: ServerConfig,
        agents: Arc<AgentRegistry>,
        manager: Arc<ConnectionManager>,
    ) -> Self {
        Self {
            config,
            agents,
            manager,
        }
    }

    /// Accept agent connections until the task is dropped
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(self.config.bind_addr)
            .await
            .map_err(|e| ServerError::Bind {
                addr: self.config.bind_addr.to_string(),
                reason: e.to_string(),
            })?;
        info!("bridge listening on {}", listener.local_addr()?);

        loop {
            match listener.accept().await {
                Ok((socket, peer_addr)) => {
                    debug!(%peer_addr, "agent connection accepted");
                    let agents = self.agents.clone();
                    let manager = self.manager.clone();
                    let config = self.config.clone();
                    tokio::spawn(async move {
                        if let Err(e) =
                            handle_agent(socket, peer_addr, config, agents, manager).await
                        {
                            warn!(%peer_addr, "agent connection failed: {}", e);
                        }
                    });
                }
                Err(e) => {
                    error!("accept failed: {}", e);
                }
            }
        }
    }
}

async fn handle_agent(
    mut socket: TcpStream,
    peer_addr: SocketAddr,
    config: ServerConfig,
    agents: Arc<AgentRegistry>,
    manager: Arc<ConnectionManager>,
) -> Result<(), ServerError> {
    let hello = match timeout(config.timeouts.handshake(), read_hello(&mut socket)).await {
        Ok(result) => result?,
        Err(_) => return Err(ServerError::HandshakeTimeout),
    };

    if hello.version == 0 {
        write_reply(
            &mut socket,
            &AuthReply::Rejected {
                reason: AuthRejectReason::UnsupportedVersion {
                    server: PROTOCOL_VERSION,
                },
            },
        )
        .await?;
        return Err(ServerError::MalformedHandshake(
            "agent speaks protocol version 0".to_string(),
        ));
    }
    let version = PROTOCOL_VERSION.min(hello.version);

    let agent_id = match agents.register(&hello.secret, hello.transport, version) {
        Ok(id) => id,
        Err(e) => {
            let reason = match &e {
                RegistryError::QuotaExceeded => AuthRejectReason::QuotaExceeded,
                _ => AuthRejectReason::BadSecret,
            };
            write_reply(&mut socket, &AuthReply::Rejected { reason }).await?;
            return Err(e.into());
        }
    };

    let session_nonce: [u8; 16] = rand::random();
    write_reply(
        &mut socket,
        &AuthReply::Accepted {
            agent_id: agent_id.clone(),
            session_nonce,
            version,
        },
    )
    .await?;

    // Everything after the accept runs through the negotiated pipeline
    let key = derive_session_key(&hello.secret, &session_nonce);
    let outbound = Pipeline::negotiated(hello.pipeline, Some(&key), Direction::BridgeToAgent)?;
    let inbound = Pipeline::negotiated(hello.pipeline, Some(&key), Direction::BridgeToAgent)?;

    let mux = MuxConnection::start(
        socket,
        MuxRole::Dialer,
        outbound,
        inbound,
        config.mux_config(),
    );
    let session = manager.install(agent_id.clone(), peer_addr, hello.pipeline, mux, key);

    info!(
        %agent_id, %peer_addr, pipeline = ?hello.pipeline, version,
        agent_host = %hello.metadata.hostname,
        "agent session established"
    );

    monitor_session(session, agents, manager, config).await;
    Ok(())
}

/// Sync traffic and liveness into the registry until the session dies
async fn monitor_session(
    session: Arc<AgentSession>,
    agents: Arc<AgentRegistry>,
    manager: Arc<ConnectionManager>,
    config: ServerConfig,
) {
    let mut tick = tokio::time::interval(MONITOR_INTERVAL);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = session.mux().closed() => break,
            _ = tick.tick() => {
                let (bytes_in, bytes_out) = session.mux().take_traffic();
                agents.record_traffic(&session.agent_id, bytes_in, bytes_out);

                if session.mux().last_pong_age_ms()
                    < config.timeouts.heartbeat_secs.saturating_mul(2000)
                {
                    agents.touch_heartbeat(&session.agent_id);
                }

                match agents.lookup(&session.agent_id) {
                    Ok(agent) if agent.traffic_exhausted() => {
                        warn!(agent_id = %session.agent_id, "traffic quota exhausted");
                        session.mux().close("traffic quota exhausted");
                    }
                    Ok(agent) if agent.revoked => {
                        session.mux().close("agent revoked");
                    }
                    _ => {}
                }
            }
        }
    }

    // Flush whatever the last tick missed
    let (bytes_in, bytes_out) = session.mux().take_traffic();
    agents.record_traffic(&session.agent_id, bytes_in, bytes_out);

    if manager.remove(&session) {
        agents.mark_disconnected(&session.agent_id);
        info!(agent_id = %session.agent_id, "agent session ended");
    }
}

/// The handshake runs on the raw socket: the agent sends nothing after its
/// hello until it sees the reply, so no multiplexed bytes can be buffered
/// here.
async fn read_hello(socket: &mut TcpStream) -> Result<AgentHello, ServerError> {
    let mut len_buf = [0u8; 4];
    socket.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_RECORD_SIZE as usize {
        return Err(ServerError::MalformedHandshake(format!(
            "handshake record of {} bytes",
            len
        )));
    }

    let mut buf = vec![0u8; len];
    socket.read_exact(&mut buf).await?;
    let frame =
        Frame::decode(Bytes::from(buf)).map_err(|e| ServerError::MalformedHandshake(e.to_string()))?;
    if frame.kind != FrameKind::Auth {
        return Err(ServerError::MalformedHandshake(format!(
            "expected auth frame, got {:?}",
            frame.kind
        )));
    }

    AgentHello::from_bytes(&frame.payload)
        .map_err(|e| ServerError::MalformedHandshake(e.to_string()))
}

async fn write_reply(socket: &mut TcpStream, reply: &AuthReply) -> Result<(), ServerError> {
    let payload = Bytes::from(
        reply
            .to_bytes()
            .map_err(|e| ServerError::MalformedHandshake(e.to_string()))?,
    );
    let frame = Frame::auth(payload).encode();

    let mut record = Vec::with_capacity(4 + frame.len());
    record.extend_from_slice(&(frame.len() as u32).to_be_bytes());
    record.extend_from_slice(&frame);
    socket.write_all(&record).await?;
    Ok(())
}
