//! Agent registry
//!
//! The set of known agents keyed by identity, with connection status,
//! traffic accounting, and heartbeat timestamps. Agents are seeded from
//! persisted configuration; `register` is the handshake-time gate.

use crate::RegistryError;
use burrow_proto::TransportKind;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

pub type AgentId = String;

/// Persisted description of a known agent
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentSpec {
    pub id: AgentId,
    /// Opaque verification secret the agent presents during the handshake
    pub secret: String,
    /// Cumulative traffic quota in bytes; `None` means unlimited
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_traffic_bytes: Option<u64>,
}

/// Agent connection status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    /// Known but never connected this process lifetime
    Pending,
    Connected,
    Disconnected,
}

/// Live agent record
#[derive(Debug, Clone)]
pub struct Agent {
    pub id: AgentId,
    pub secret: String,
    pub status: AgentStatus,
    /// Transport negotiated at the last handshake
    pub transport: TransportKind,
    /// Protocol version negotiated at the last handshake
    pub version: u32,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub last_heartbeat: DateTime<Utc>,
    pub max_traffic_bytes: Option<u64>,
    pub revoked: bool,
}

impl Agent {
    fn from_spec(spec: AgentSpec) -> Self {
        Self {
            id: spec.id,
            secret: spec.secret,
            status: AgentStatus::Pending,
            transport: TransportKind::Stream,
            version: 0,
            bytes_in: 0,
            bytes_out: 0,
            last_heartbeat: Utc::now(),
            max_traffic_bytes: spec.max_traffic_bytes,
            revoked: false,
        }
    }

    pub fn traffic_exhausted(&self) -> bool {
        match self.max_traffic_bytes {
            Some(max) => self.bytes_in + self.bytes_out >= max,
            None => false,
        }
    }
}

/// Concurrent registry of known agents
pub struct AgentRegistry {
    agents: DashMap<AgentId, Agent>,
    /// secret -> agent id, for handshake lookup
    by_secret: DashMap<String, AgentId>,
    /// Cap on simultaneously connected agents; `None` means unlimited
    max_connected: Option<usize>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self {
            agents: DashMap::new(),
            by_secret: DashMap::new(),
            max_connected: None,
        }
    }

    pub fn with_max_connected(mut self, max: usize) -> Self {
        self.max_connected = Some(max);
        self
    }

    /// Load known agents from persisted configuration
    pub fn seed(&self, specs: Vec<AgentSpec>) {
        for spec in specs {
            self.by_secret.insert(spec.secret.clone(), spec.id.clone());
            self.agents
                .insert(spec.id.clone(), Agent::from_spec(spec));
        }
    }

    /// Handshake-time registration: validate the secret and transition the
    /// agent to `Connected`.
    pub fn register(
        &self,
        secret: &str,
        transport: TransportKind,
        version: u32,
    ) -> Result<AgentId, RegistryError> {
        let id = self
            .by_secret
            .get(secret)
            .map(|e| e.value().clone())
            .ok_or(RegistryError::AuthFailed)?;

        // Quota gate: already-connected agents reconnecting do not count twice
        if let Some(max) = self.max_connected {
            let connected_others = self
                .agents
                .iter()
                .filter(|e| e.status == AgentStatus::Connected && *e.key() != id)
                .count();
            if connected_others >= max {
                return Err(RegistryError::QuotaExceeded);
            }
        }

        let mut agent = self
            .agents
            .get_mut(&id)
            .ok_or(RegistryError::AuthFailed)?;
        if agent.revoked {
            return Err(RegistryError::AuthFailed);
        }
        if agent.traffic_exhausted() {
            return Err(RegistryError::QuotaExceeded);
        }

        agent.status = AgentStatus::Connected;
        agent.transport = transport;
        agent.version = version;
        agent.last_heartbeat = Utc::now();

        info!(agent_id = %id, ?transport, version, "agent connected");
        Ok(id)
    }

    pub fn lookup(&self, id: &str) -> Result<Agent, RegistryError> {
        self.agents
            .get(id)
            .map(|e| e.value().clone())
            .ok_or_else(|| RegistryError::AgentNotFound(id.to_string()))
    }

    pub fn is_connected(&self, id: &str) -> bool {
        self.agents
            .get(id)
            .map(|e| e.status == AgentStatus::Connected)
            .unwrap_or(false)
    }

    pub fn mark_disconnected(&self, id: &str) {
        if let Some(mut agent) = self.agents.get_mut(id) {
            if agent.status == AgentStatus::Connected {
                agent.status = AgentStatus::Disconnected;
                debug!(agent_id = %id, "agent disconnected");
            }
        }
    }

    pub fn record_traffic(&self, id: &str, bytes_in: u64, bytes_out: u64) {
        if let Some(mut agent) = self.agents.get_mut(id) {
            agent.bytes_in += bytes_in;
            agent.bytes_out += bytes_out;
        }
    }

    pub fn touch_heartbeat(&self, id: &str) {
        if let Some(mut agent) = self.agents.get_mut(id) {
            agent.last_heartbeat = Utc::now();
        }
    }

    /// Administrative revocation; the agent cannot re-register afterwards
    pub fn revoke(&self, id: &str) -> Result<(), RegistryError> {
        let mut agent = self
            .agents
            .get_mut(id)
            .ok_or_else(|| RegistryError::AgentNotFound(id.to_string()))?;
        agent.revoked = true;
        agent.status = AgentStatus::Disconnected;
        info!(agent_id = %id, "agent revoked");
        Ok(())
    }

    pub fn connected_count(&self) -> usize {
        self.agents
            .iter()
            .filter(|e| e.status == AgentStatus::Connected)
            .count()
    }

    pub fn all(&self) -> Vec<Agent> {
        self.agents.iter().map(|e| e.value().clone()).collect()
    }

    pub fn specs(&self) -> Vec<AgentSpec> {
        self.agents
            .iter()
            .map(|e| AgentSpec {
                id: e.id.clone(),
                secret: e.secret.clone(),
                max_traffic_bytes: e.max_traffic_bytes,
            })
            .collect()
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded() -> AgentRegistry {
        let registry = AgentRegistry::new();
        registry.seed(vec![
            AgentSpec {
                id: "agent-1".to_string(),
                secret: "s1".to_string(),
                max_traffic_bytes: None,
            },
            AgentSpec {
                id: "agent-2".to_string(),
                secret: "s2".to_string(),
                max_traffic_bytes: Some(100),
            },
        ]);
        registry
    }

    #[test]
    fn test_register_known_secret() {
        let registry = seeded();
        let id = registry
            .register("s1", TransportKind::Stream, 1)
            .unwrap();
        assert_eq!(id, "agent-1");
        assert_eq!(registry.lookup("agent-1").unwrap().status, AgentStatus::Connected);
    }

    #[test]
    fn test_register_unknown_secret() {
        let registry = seeded();
        assert!(matches!(
            registry.register("nope", TransportKind::Stream, 1),
            Err(RegistryError::AuthFailed)
        ));
    }

    #[test]
    fn test_revoked_agent_cannot_register() {
        let registry = seeded();
        registry.revoke("agent-1").unwrap();
        assert!(matches!(
            registry.register("s1", TransportKind::Stream, 1),
            Err(RegistryError::AuthFailed)
        ));
    }

    #[test]
    fn test_connection_quota() {
        let registry = seeded().with_max_connected(1);
        registry.register("s1", TransportKind::Stream, 1).unwrap();
        assert!(matches!(
            registry.register("s2", TransportKind::Stream, 1),
            Err(RegistryError::QuotaExceeded)
        ));

        // Reconnecting the same agent is not a second slot
        registry.register("s1", TransportKind::Stream, 1).unwrap();
    }

    #[test]
    fn test_traffic_quota() {
        let registry = seeded();
        registry.record_traffic("agent-2", 60, 60);
        assert!(matches!(
            registry.register("s2", TransportKind::Stream, 1),
            Err(RegistryError::QuotaExceeded)
        ));
    }

    #[test]
    fn test_disconnect_and_reconnect() {
        let registry = seeded();
        registry.register("s1", TransportKind::Stream, 1).unwrap();
        registry.mark_disconnected("agent-1");
        assert_eq!(
            registry.lookup("agent-1").unwrap().status,
            AgentStatus::Disconnected
        );

        let id = registry.register("s1", TransportKind::Stream, 1).unwrap();
        assert_eq!(id, "agent-1");
        assert!(registry.is_connected("agent-1"));
    }

    #[test]
    fn test_traffic_accounting() {
        let registry = seeded();
        registry.record_traffic("agent-1", 10, 20);
        registry.record_traffic("agent-1", 5, 5);
        let agent = registry.lookup("agent-1").unwrap();
        assert_eq!(agent.bytes_in, 15);
        assert_eq!(agent.bytes_out, 25);
    }
}
