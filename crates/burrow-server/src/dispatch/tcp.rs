//! Public TCP endpoint
//!
//! One listener per tcp tunnel port. Every accepted connection becomes one
//! logical stream to the owning agent.

use crate::session::ConnectionManager;
use crate::ServerError;
use burrow_mux::relay;
use burrow_registry::TunnelRegistry;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub struct TcpDispatcher {
    pub port: u16,
    pub tunnels: Arc<TunnelRegistry>,
    pub manager: Arc<ConnectionManager>,
}

impl TcpDispatcher {
    pub async fn run(self, cancel: CancellationToken) -> Result<(), ServerError> {
        let listener = TcpListener::bind(("0.0.0.0", self.port))
            .await
            .map_err(|e| ServerError::Bind {
                addr: format!("0.0.0.0:{}", self.port),
                reason: e.to_string(),
            })?;
        info!(port = self.port, "tcp endpoint listening");

        loop {
            let (socket, peer_addr) = tokio::select! {
                _ = cancel.cancelled() => {
                    info!(port = self.port, "tcp endpoint draining");
                    return Ok(());
                }
                accepted = listener.accept() => accepted?,
            };

            // Re-resolve per connection so disable/remove takes effect
            // without restarting the listener
            let tunnel = match self.tunnels.resolve_tcp(self.port) {
                Ok(t) => t,
                Err(e) => {
                    debug!(port = self.port, %peer_addr, "refusing connection: {}", e);
                    continue;
                }
            };
            if !tunnel.access.permits_socket(&peer_addr) {
                debug!(tunnel_id = %tunnel.id, %peer_addr, "source address denied");
                continue;
            }

            let manager = self.manager.clone();
            let drain = cancel.child_token();
            tokio::spawn(async move {
                let conn_id = Uuid::new_v4();
                let (stream, seal) = match manager.open_tunnel_stream(&tunnel).await {
                    Ok(pair) => pair,
                    Err(e) => {
                        // Fast failure: the public client sees an immediate
                        // close instead of a hang
                        warn!(tunnel_id = %tunnel.id, %conn_id, "cannot reach agent: {}", e);
                        return;
                    }
                };

                debug!(tunnel_id = %tunnel.id, %peer_addr, %conn_id, "tcp connection bridged");
                // Tunnel removal cancels the port token; open connections
                // are dropped, not just the listener
                tokio::select! {
                    _ = drain.cancelled() => {
                        debug!(tunnel_id = %tunnel.id, %conn_id, "tcp connection drained");
                    }
                    result = relay(stream, socket, seal) => match result {
                        Ok(stats) => debug!(
                            tunnel_id = %tunnel.id, %conn_id,
                            bytes_in = stats.bytes_in, bytes_out = stats.bytes_out,
                            "tcp connection finished"
                        ),
                        Err(e) => debug!(tunnel_id = %tunnel.id, %conn_id, "tcp relay ended: {}", e),
                    }
                }
            });
        }
    }
}
