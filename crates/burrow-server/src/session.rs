//! Live agent sessions
//!
//! One `AgentSession` wraps the multiplexed physical connection of one
//! authenticated agent. The `ConnectionManager` is the routing surface the
//! dispatchers use: tunnel -> session -> new logical stream.

use crate::ServerError;
use burrow_mux::{MuxConnection, MuxStream, StreamSeal};
use burrow_pipeline::Direction;
use burrow_proto::{OpenRequest, PipelineMode, TransportKind, TunnelMode};
use burrow_registry::{AgentId, RegistryError, Tunnel};
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

pub struct AgentSession {
    pub agent_id: AgentId,
    pub peer_addr: SocketAddr,
    pub pipeline: PipelineMode,
    pub connected_at: Instant,
    mux: Arc<MuxConnection>,
    session_key: [u8; 32],
    /// Distinguishes this session from an earlier one for the same agent
    epoch: u64,
}

impl AgentSession {
    pub fn mux(&self) -> &MuxConnection {
        &self.mux
    }

    pub fn session_key(&self) -> &[u8; 32] {
        &self.session_key
    }
}

/// Shared map of connected agent sessions
pub struct ConnectionManager {
    sessions: DashMap<AgentId, Arc<AgentSession>>,
    next_epoch: AtomicU64,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            next_epoch: AtomicU64::new(1),
        }
    }

    /// Install a freshly authenticated session. A still-live previous
    /// connection for the same agent is superseded and closed.
    pub fn install(
        &self,
        agent_id: AgentId,
        peer_addr: SocketAddr,
        pipeline: PipelineMode,
        mux: MuxConnection,
        session_key: [u8; 32],
    ) -> Arc<AgentSession> {
        let session = Arc::new(AgentSession {
            agent_id: agent_id.clone(),
            peer_addr,
            pipeline,
            connected_at: Instant::now(),
            mux: Arc::new(mux),
            session_key,
            epoch: self.next_epoch.fetch_add(1, Ordering::Relaxed),
        });

        if let Some(old) = self.sessions.insert(agent_id.clone(), session.clone()) {
            info!(agent_id = %agent_id, "superseding previous connection");
            old.mux.close("superseded by a newer connection");
        }
        session
    }

    /// Remove a session, but only if it has not already been superseded
    pub fn remove(&self, session: &AgentSession) -> bool {
        let removed = self
            .sessions
            .remove_if(&session.agent_id, |_, current| {
                current.epoch == session.epoch
            })
            .is_some();
        if removed {
            debug!(agent_id = %session.agent_id, "session removed");
        }
        removed
    }

    pub fn get(&self, agent_id: &str) -> Option<Arc<AgentSession>> {
        self.sessions.get(agent_id).map(|e| e.value().clone())
    }

    pub fn sessions(&self) -> Vec<Arc<AgentSession>> {
        self.sessions.iter().map(|e| e.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Open a logical stream for a tunnel, dialing `target` on the private
    /// side. Returns the stream plus the per-stream seal both relays use.
    pub async fn open_stream_to(
        &self,
        tunnel: &Tunnel,
        target: &str,
    ) -> Result<(MuxStream, StreamSeal), ServerError> {
        let session = self
            .get(&tunnel.agent)
            .filter(|s| !s.mux.is_closed())
            .ok_or(RegistryError::NoRoute)?;

        let protocol = match tunnel.mode {
            TunnelMode::Udp { .. } => TransportKind::Datagram,
            _ => TransportKind::Stream,
        };
        let request = OpenRequest {
            tunnel_id: tunnel.id.clone(),
            target: target.to_string(),
            protocol,
            pipeline: tunnel.pipeline,
        };

        let stream = session.mux.open_stream(&request).await?;
        let seal = StreamSeal::negotiated(
            tunnel.pipeline,
            &session.session_key,
            stream.id(),
            Direction::BridgeToAgent,
        )?;
        Ok((stream, seal))
    }

    /// [`ConnectionManager::open_stream_to`] with the tunnel's configured target
    pub async fn open_tunnel_stream(
        &self,
        tunnel: &Tunnel,
    ) -> Result<(MuxStream, StreamSeal), ServerError> {
        self.open_stream_to(tunnel, &tunnel.target).await
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}
