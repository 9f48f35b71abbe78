//! Public SOCKS5 endpoint
//!
//! A socks5 tunnel turns its port into a CONNECT-only SOCKS5 server whose
//! destinations are dialed from the agent's private side. Routing requires
//! the explicit catch-all tunnel; no other mode answers on the port.

use crate::session::ConnectionManager;
use crate::ServerError;
use burrow_mux::relay;
use burrow_registry::TunnelRegistry;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const SOCKS_VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_UNACCEPTABLE: u8 = 0xFF;
const CMD_CONNECT: u8 = 0x01;

const REPLY_SUCCESS: u8 = 0x00;
const REPLY_HOST_UNREACHABLE: u8 = 0x04;
const REPLY_COMMAND_UNSUPPORTED: u8 = 0x07;
const REPLY_ADDRESS_UNSUPPORTED: u8 = 0x08;

pub struct SocksDispatcher {
    pub port: u16,
    pub tunnels: Arc<TunnelRegistry>,
    pub manager: Arc<ConnectionManager>,
}

impl SocksDispatcher {
    pub async fn run(self, cancel: CancellationToken) -> Result<(), ServerError> {
        let listener = TcpListener::bind(("0.0.0.0", self.port))
            .await
            .map_err(|e| ServerError::Bind {
                addr: format!("0.0.0.0:{}", self.port),
                reason: e.to_string(),
            })?;
        info!(port = self.port, "socks5 endpoint listening");

        loop {
            let (socket, peer_addr) = tokio::select! {
                _ = cancel.cancelled() => {
                    info!(port = self.port, "socks5 endpoint draining");
                    return Ok(());
                }
                accepted = listener.accept() => accepted?,
            };

            let tunnels = self.tunnels.clone();
            let manager = self.manager.clone();
            let port = self.port;
            let drain = cancel.child_token();
            tokio::spawn(async move {
                if let Err(e) =
                    handle_socks(socket, peer_addr, port, tunnels, manager, drain).await
                {
                    debug!(%peer_addr, "socks5 connection failed: {}", e);
                }
            });
        }
    }
}

async fn handle_socks(
    mut socket: TcpStream,
    peer_addr: SocketAddr,
    port: u16,
    tunnels: Arc<TunnelRegistry>,
    manager: Arc<ConnectionManager>,
    drain: CancellationToken,
) -> Result<(), ServerError> {
    let tunnel = match tunnels.resolve_socks(port) {
        Ok(t) => t,
        Err(e) => {
            debug!(port, %peer_addr, "refusing connection: {}", e);
            return Ok(());
        }
    };
    if !tunnel.access.permits_socket(&peer_addr) {
        debug!(tunnel_id = %tunnel.id, %peer_addr, "source address denied");
        return Ok(());
    }

    // Method negotiation
    let mut greeting = [0u8; 2];
    socket.read_exact(&mut greeting).await?;
    if greeting[0] != SOCKS_VERSION {
        return Err(ServerError::MalformedHandshake(format!(
            "socks version {}",
            greeting[0]
        )));
    }
    let mut methods = vec![0u8; greeting[1] as usize];
    socket.read_exact(&mut methods).await?;
    if !methods.contains(&METHOD_NO_AUTH) {
        socket
            .write_all(&[SOCKS_VERSION, METHOD_UNACCEPTABLE])
            .await?;
        return Ok(());
    }
    socket.write_all(&[SOCKS_VERSION, METHOD_NO_AUTH]).await?;

    // Request
    let mut header = [0u8; 4];
    socket.read_exact(&mut header).await?;
    if header[1] != CMD_CONNECT {
        reply(&mut socket, REPLY_COMMAND_UNSUPPORTED).await?;
        return Ok(());
    }
    let target = match read_target(&mut socket, header[3]).await? {
        Some(target) => target,
        None => {
            reply(&mut socket, REPLY_ADDRESS_UNSUPPORTED).await?;
            return Ok(());
        }
    };

    let (stream, seal) = match manager.open_stream_to(&tunnel, &target).await {
        Ok(pair) => pair,
        Err(e) => {
            warn!(tunnel_id = %tunnel.id, %target, "cannot reach agent: {}", e);
            reply(&mut socket, REPLY_HOST_UNREACHABLE).await?;
            return Ok(());
        }
    };
    reply(&mut socket, REPLY_SUCCESS).await?;

    debug!(tunnel_id = %tunnel.id, %peer_addr, %target, "socks5 connection bridged");
    // Tunnel removal cancels the port token and drops the open connection
    tokio::select! {
        _ = drain.cancelled() => {
            debug!(tunnel_id = %tunnel.id, %peer_addr, "socks5 connection drained");
        }
        result = relay(stream, socket, seal) => {
            result?;
        }
    }
    Ok(())
}

/// Read the destination as a "host:port" string; `None` for address types
/// we do not speak
async fn read_target(socket: &mut TcpStream, atyp: u8) -> Result<Option<String>, ServerError> {
    let host = match atyp {
        // IPv4
        0x01 => {
            let mut addr = [0u8; 4];
            socket.read_exact(&mut addr).await?;
            std::net::Ipv4Addr::from(addr).to_string()
        }
        // Domain name
        0x03 => {
            let mut len = [0u8; 1];
            socket.read_exact(&mut len).await?;
            let mut name = vec![0u8; len[0] as usize];
            socket.read_exact(&mut name).await?;
            match String::from_utf8(name) {
                Ok(name) => name,
                Err(_) => return Ok(None),
            }
        }
        // IPv6
        0x04 => {
            let mut addr = [0u8; 16];
            socket.read_exact(&mut addr).await?;
            format!("[{}]", std::net::Ipv6Addr::from(addr))
        }
        _ => return Ok(None),
    };

    let mut port = [0u8; 2];
    socket.read_exact(&mut port).await?;
    Ok(Some(format!("{}:{}", host, u16::from_be_bytes(port))))
}

async fn reply(socket: &mut TcpStream, code: u8) -> Result<(), ServerError> {
    // Bind address is reported as 0.0.0.0:0; clients only act on the code
    socket
        .write_all(&[SOCKS_VERSION, code, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
        .await?;
    Ok(())
}
