//! Tunnel registry
//!
//! Maps public bindings (port or HTTP host + path prefix) to tunnels. Every
//! port is owned by exactly one tunnel regardless of mode, which is what
//! keeps resolution unambiguous: an HTTP host rule and a SOCKS5 catch-all
//! can never contend for the same socket.

use crate::access::AccessRule;
use crate::agents::AgentId;
use crate::RegistryError;
use burrow_proto::{PipelineMode, TunnelMode};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info};

fn default_enabled() -> bool {
    true
}

/// A configured mapping from a public endpoint to a private target
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tunnel {
    pub id: String,
    /// Owning agent
    pub agent: AgentId,
    #[serde(flatten)]
    pub mode: TunnelMode,
    /// Private-side address the agent dials, "host:port". Ignored for
    /// SOCKS5 tunnels, where the destination comes from each request.
    #[serde(default)]
    pub target: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Per-stream compression/encryption applied on top of the connection
    /// pipeline for this tunnel's traffic
    #[serde(default)]
    pub pipeline: PipelineMode,
    /// HTTP Basic credentials ("user:pass"); empty means no site protection
    #[serde(default)]
    pub http_auth: Vec<String>,
    /// Headers inserted or overridden on forwarded HTTP requests
    #[serde(default)]
    pub http_headers: Vec<(String, String)>,
    #[serde(default)]
    pub access: AccessRule,
}

/// Registry change notifications, consumed by the dispatcher supervisor and
/// the save-on-change persistence hook
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    TunnelAdded(Tunnel),
    TunnelRemoved(Tunnel),
    TunnelEnabled { id: String, enabled: bool },
}

/// Concurrent registry of tunnel bindings
pub struct TunnelRegistry {
    tunnels: DashMap<String, Tunnel>,
    /// port -> tunnel id, for tcp/udp/socks5 bindings
    by_port: DashMap<u16, String>,
    /// (host, path prefix) -> tunnel id, for http bindings
    by_host: DashMap<(String, String), String>,
    events: broadcast::Sender<RegistryEvent>,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            tunnels: DashMap::new(),
            by_port: DashMap::new(),
            by_host: DashMap::new(),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// Register a tunnel binding
    pub fn add(&self, tunnel: Tunnel) -> Result<(), RegistryError> {
        tunnel.access.validate()?;

        match &tunnel.mode {
            TunnelMode::Http { host, path_prefix } => {
                let key = (host.clone(), path_prefix.clone());
                if let Some(existing) = self.by_host.get(&key) {
                    return Err(RegistryError::HostConflict {
                        host: host.clone(),
                        path_prefix: path_prefix.clone(),
                        tunnel_id: existing.value().clone(),
                    });
                }
                self.by_host.insert(key, tunnel.id.clone());
            }
            mode => {
                // bind_port is Some for every non-http mode
                let port = mode.bind_port().unwrap_or_default();
                if let Some(existing) = self.by_port.get(&port) {
                    return Err(RegistryError::PortInUse(port, existing.value().clone()));
                }
                self.by_port.insert(port, tunnel.id.clone());
            }
        }

        info!(tunnel_id = %tunnel.id, agent = %tunnel.agent, mode = ?tunnel.mode, "tunnel registered");
        self.tunnels.insert(tunnel.id.clone(), tunnel.clone());
        let _ = self.events.send(RegistryEvent::TunnelAdded(tunnel));
        Ok(())
    }

    /// Remove a tunnel. Dispatchers react to the removal event by draining
    /// (closing) any streams still open on it.
    pub fn remove(&self, id: &str) -> Result<Tunnel, RegistryError> {
        let (_, tunnel) = self
            .tunnels
            .remove(id)
            .ok_or_else(|| RegistryError::TunnelNotFound(id.to_string()))?;

        match &tunnel.mode {
            TunnelMode::Http { host, path_prefix } => {
                self.by_host.remove(&(host.clone(), path_prefix.clone()));
            }
            mode => {
                if let Some(port) = mode.bind_port() {
                    self.by_port.remove(&port);
                }
            }
        }

        info!(tunnel_id = %id, "tunnel removed");
        let _ = self.events.send(RegistryEvent::TunnelRemoved(tunnel.clone()));
        Ok(tunnel)
    }

    pub fn set_enabled(&self, id: &str, enabled: bool) -> Result<(), RegistryError> {
        let mut tunnel = self
            .tunnels
            .get_mut(id)
            .ok_or_else(|| RegistryError::TunnelNotFound(id.to_string()))?;
        if tunnel.enabled != enabled {
            tunnel.enabled = enabled;
            debug!(tunnel_id = %id, enabled, "tunnel toggled");
            let _ = self.events.send(RegistryEvent::TunnelEnabled {
                id: id.to_string(),
                enabled,
            });
        }
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Tunnel, RegistryError> {
        self.tunnels
            .get(id)
            .map(|e| e.value().clone())
            .ok_or_else(|| RegistryError::TunnelNotFound(id.to_string()))
    }

    fn resolve_port(&self, port: u16) -> Result<Tunnel, RegistryError> {
        let id = self.by_port.get(&port).ok_or(RegistryError::NoRoute)?;
        let tunnel = self
            .tunnels
            .get(id.value())
            .map(|e| e.value().clone())
            .ok_or(RegistryError::NoRoute)?;
        if !tunnel.enabled {
            return Err(RegistryError::NoRoute);
        }
        Ok(tunnel)
    }

    pub fn resolve_tcp(&self, port: u16) -> Result<Tunnel, RegistryError> {
        let tunnel = self.resolve_port(port)?;
        match tunnel.mode {
            TunnelMode::Tcp { .. } => Ok(tunnel),
            _ => Err(RegistryError::NoRoute),
        }
    }

    pub fn resolve_udp(&self, port: u16) -> Result<Tunnel, RegistryError> {
        let tunnel = self.resolve_port(port)?;
        match tunnel.mode {
            TunnelMode::Udp { .. } => Ok(tunnel),
            _ => Err(RegistryError::NoRoute),
        }
    }

    /// SOCKS5 routing requires an explicit catch-all tunnel on the listener
    /// port; there is no implicit fallback to other modes.
    pub fn resolve_socks(&self, port: u16) -> Result<Tunnel, RegistryError> {
        let tunnel = self.resolve_port(port)?;
        match tunnel.mode {
            TunnelMode::Socks5 { .. } => Ok(tunnel),
            _ => Err(RegistryError::NoRoute),
        }
    }

    /// Resolve an HTTP request by exact host and longest matching path prefix
    pub fn resolve_http(&self, host: &str, path: &str) -> Result<Tunnel, RegistryError> {
        let mut best: Option<(usize, String)> = None;

        for entry in self.by_host.iter() {
            let (entry_host, prefix) = entry.key();
            if entry_host != host || !path.starts_with(prefix.as_str()) {
                continue;
            }
            let better = match &best {
                Some((len, _)) => prefix.len() > *len,
                None => true,
            };
            if better {
                best = Some((prefix.len(), entry.value().clone()));
            }
        }

        let (_, id) = best.ok_or(RegistryError::NoRoute)?;
        let tunnel = self
            .tunnels
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or(RegistryError::NoRoute)?;
        if !tunnel.enabled {
            return Err(RegistryError::NoRoute);
        }
        Ok(tunnel)
    }

    pub fn for_agent(&self, agent: &str) -> Vec<Tunnel> {
        self.tunnels
            .iter()
            .filter(|e| e.agent == agent)
            .map(|e| e.value().clone())
            .collect()
    }

    pub fn all(&self) -> Vec<Tunnel> {
        self.tunnels.iter().map(|e| e.value().clone()).collect()
    }

    pub fn count(&self) -> usize {
        self.tunnels.len()
    }
}

impl Default for TunnelRegistry {
    fn default() -> Self {
        Self::new()
    }
}
