//! Proxy dispatchers and their supervisor
//!
//! Port-bound tunnels (tcp, udp, socks5) each get a dispatcher task; http
//! tunnels share one listener. The supervisor owns their lifecycles: it
//! reacts to registry events, restarts a dispatcher that fails with capped
//! backoff, and cancels dispatchers whose tunnels go away.

mod http;
mod socks;
mod tcp;
mod udp;

pub use http::HttpDispatcher;
pub use socks::SocksDispatcher;
pub use tcp::TcpDispatcher;
pub use udp::UdpDispatcher;

use crate::config::ServerConfig;
use crate::session::ConnectionManager;
use crate::ServerError;
use burrow_proto::TunnelMode;
use burrow_registry::{RegistryEvent, Tunnel, TunnelRegistry};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

pub struct DispatcherSupervisor {
    config: ServerConfig,
    tunnels: Arc<TunnelRegistry>,
    manager: Arc<ConnectionManager>,
    /// One cancellation token per bound public port
    ports: DashMap<u16, CancellationToken>,
    /// One drain token per http tunnel on the shared listener
    http_drains: Arc<DashMap<String, CancellationToken>>,
    shutdown: CancellationToken,
}

impl DispatcherSupervisor {
    pub fn new(
        config: ServerConfig,
        tunnels: Arc<TunnelRegistry>,
        manager: Arc<ConnectionManager>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            tunnels,
            manager,
            ports: DashMap::new(),
            http_drains: Arc::new(DashMap::new()),
            shutdown: CancellationToken::new(),
        })
    }

    /// Bring up dispatchers for every registered tunnel and follow registry
    /// events from then on
    pub fn start(self: &Arc<Self>) {
        if let Some(bind_addr) = self.config.http_bind {
            for tunnel in self.tunnels.all() {
                if matches!(tunnel.mode, TunnelMode::Http { .. }) {
                    self.http_drains
                        .insert(tunnel.id.clone(), self.shutdown.child_token());
                }
            }

            let supervisor = self.clone();
            let cancel = self.shutdown.child_token();
            tokio::spawn(async move {
                let mut backoff = INITIAL_BACKOFF;
                loop {
                    let dispatcher = HttpDispatcher {
                        bind_addr,
                        tunnels: supervisor.tunnels.clone(),
                        manager: supervisor.manager.clone(),
                        drains: supervisor.http_drains.clone(),
                        idle: supervisor.config.timeouts.http_idle(),
                    };
                    match dispatcher.run(cancel.clone()).await {
                        Ok(()) => return,
                        Err(e) => {
                            if !sleep_before_restart("http", &e, &cancel, &mut backoff).await {
                                return;
                            }
                        }
                    }
                }
            });
        }

        for tunnel in self.tunnels.all() {
            self.spawn_port_dispatcher(&tunnel);
        }

        let supervisor = self.clone();
        tokio::spawn(async move {
            supervisor.follow_registry().await;
        });
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    async fn follow_registry(self: Arc<Self>) {
        let mut events = self.tunnels.subscribe();
        loop {
            let event = tokio::select! {
                _ = self.shutdown.cancelled() => return,
                event = events.recv() => event,
            };
            match event {
                Ok(RegistryEvent::TunnelAdded(tunnel)) => {
                    if matches!(tunnel.mode, TunnelMode::Http { .. }) {
                        self.http_drains
                            .insert(tunnel.id.clone(), self.shutdown.child_token());
                    }
                    self.spawn_port_dispatcher(&tunnel);
                }
                Ok(RegistryEvent::TunnelRemoved(tunnel)) => {
                    if let Some((_, drain)) = self.http_drains.remove(&tunnel.id) {
                        drain.cancel();
                    }
                    if let Some(port) = tunnel.mode.bind_port() {
                        self.stop_port(port);
                    }
                }
                // Disabled tunnels stay bound; per-connection resolution
                // already refuses them
                Ok(RegistryEvent::TunnelEnabled { .. }) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "registry event stream lagged, resyncing");
                    self.resync();
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            }
        }
    }

    /// Reconcile running dispatchers against the registry after lag
    fn resync(self: &Arc<Self>) {
        let wanted: std::collections::HashSet<u16> = self
            .tunnels
            .all()
            .iter()
            .filter_map(|t| t.mode.bind_port())
            .collect();

        let running: Vec<u16> = self.ports.iter().map(|e| *e.key()).collect();
        for port in running {
            if !wanted.contains(&port) {
                self.stop_port(port);
            }
        }

        let wanted_http: std::collections::HashSet<String> = self
            .tunnels
            .all()
            .iter()
            .filter(|t| matches!(t.mode, TunnelMode::Http { .. }))
            .map(|t| t.id.clone())
            .collect();
        let draining: Vec<String> = self.http_drains.iter().map(|e| e.key().clone()).collect();
        for id in draining {
            if !wanted_http.contains(&id) {
                if let Some((_, drain)) = self.http_drains.remove(&id) {
                    drain.cancel();
                }
            }
        }
        for id in wanted_http {
            self.http_drains
                .entry(id)
                .or_insert_with(|| self.shutdown.child_token());
        }

        for tunnel in self.tunnels.all() {
            self.spawn_port_dispatcher(&tunnel);
        }
    }

    fn spawn_port_dispatcher(self: &Arc<Self>, tunnel: &Tunnel) {
        let Some(port) = tunnel.mode.bind_port() else {
            return;
        };
        if self.ports.contains_key(&port) {
            return;
        }

        let cancel = self.shutdown.child_token();
        self.ports.insert(port, cancel.clone());

        let supervisor = self.clone();
        let mode = tunnel.mode.clone();
        let tunnel_id = tunnel.id.clone();
        tokio::spawn(async move {
            let label = match mode {
                TunnelMode::Tcp { .. } => "tcp",
                TunnelMode::Udp { .. } => "udp",
                TunnelMode::Socks5 { .. } => "socks5",
                TunnelMode::Http { .. } => return,
            };

            let mut backoff = INITIAL_BACKOFF;
            loop {
                match supervisor.run_port_dispatcher(&mode, port, cancel.clone()).await {
                    Ok(()) => break,
                    Err(e) => {
                        if !sleep_before_restart(label, &e, &cancel, &mut backoff).await {
                            break;
                        }
                    }
                }
            }
            supervisor.ports.remove(&port);
            info!(port, tunnel_id = %tunnel_id, "port dispatcher stopped");
        });
    }

    async fn run_port_dispatcher(
        &self,
        mode: &TunnelMode,
        port: u16,
        cancel: CancellationToken,
    ) -> Result<(), ServerError> {
        match mode {
            TunnelMode::Tcp { .. } => {
                TcpDispatcher {
                    port,
                    tunnels: self.tunnels.clone(),
                    manager: self.manager.clone(),
                }
                .run(cancel)
                .await
            }
            TunnelMode::Udp { .. } => {
                UdpDispatcher {
                    port,
                    tunnels: self.tunnels.clone(),
                    manager: self.manager.clone(),
                    idle: self.config.timeouts.udp_idle(),
                }
                .run(cancel)
                .await
            }
            TunnelMode::Socks5 { .. } => {
                SocksDispatcher {
                    port,
                    tunnels: self.tunnels.clone(),
                    manager: self.manager.clone(),
                }
                .run(cancel)
                .await
            }
            TunnelMode::Http { .. } => Ok(()),
        }
    }

    fn stop_port(&self, port: u16) {
        if let Some((_, cancel)) = self.ports.remove(&port) {
            cancel.cancel();
        }
    }
}

/// Log a dispatcher failure and wait out the backoff. Returns false when
/// the dispatcher should stay down.
async fn sleep_before_restart(
    label: &str,
    err: &ServerError,
    cancel: &CancellationToken,
    backoff: &mut Duration,
) -> bool {
    if cancel.is_cancelled() {
        return false;
    }
    error!(
        dispatcher = label,
        "dispatcher failed: {}, restarting in {:?}", err, backoff
    );
    tokio::select! {
        _ = cancel.cancelled() => return false,
        _ = tokio::time::sleep(*backoff) => {}
    }
    *backoff = (*backoff * 2).min(MAX_BACKOFF);
    true
}
