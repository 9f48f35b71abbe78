//! Bridge behavior against a scripted agent peer

use burrow_mux::{relay, MuxConfig, MuxConnection, MuxRole, StreamSeal};
use burrow_pipeline::{derive_session_key, Direction, Pipeline};
use burrow_proto::{
    AgentHello, AgentMetadata, AuthRejectReason, AuthReply, Frame, FrameKind, PipelineMode,
    TransportKind, PROTOCOL_VERSION,
};
use burrow_registry::{AccessRule, AgentRegistry, AgentSpec, Tunnel, TunnelRegistry};
use burrow_server::{BridgeServer, ConnectionManager, DispatcherSupervisor, ServerConfig};
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout};

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

struct Harness {
    bridge_addr: SocketAddr,
    tunnels: Arc<TunnelRegistry>,
    manager: Arc<ConnectionManager>,
}

async fn start_server(mut config: ServerConfig, tunnels: Vec<Tunnel>) -> Harness {
    let bridge_port = free_port();
    config.bind_addr = format!("127.0.0.1:{}", bridge_port).parse().unwrap();
    config.agents = vec![AgentSpec {
        id: "agent-1".to_string(),
        secret: "verify-key-1".to_string(),
        max_traffic_bytes: None,
    }];

    let agents = Arc::new(AgentRegistry::new());
    agents.seed(config.agents.clone());
    let tunnel_registry = Arc::new(TunnelRegistry::new());
    for tunnel in tunnels {
        tunnel_registry.add(tunnel).unwrap();
    }
    let manager = Arc::new(ConnectionManager::new());

    let bridge = BridgeServer::new(config.clone(), agents.clone(), manager.clone());
    tokio::spawn(async move {
        let _ = bridge.run().await;
    });

    let supervisor = DispatcherSupervisor::new(config.clone(), tunnel_registry.clone(), manager.clone());
    supervisor.start();

    // Give the listeners a moment to bind
    sleep(Duration::from_millis(200)).await;

    Harness {
        bridge_addr: config.bind_addr,
        tunnels: tunnel_registry,
        manager,
    }
}

fn tcp_tunnel(id: &str, bind_port: u16, target: &str) -> Tunnel {
    Tunnel {
        id: id.to_string(),
        agent: "agent-1".to_string(),
        mode: burrow_proto::TunnelMode::Tcp { bind_port },
        target: target.to_string(),
        enabled: true,
        pipeline: PipelineMode::None,
        http_auth: vec![],
        http_headers: vec![],
        access: AccessRule::default(),
    }
}

async fn handshake(addr: SocketAddr, secret: &str, pipeline: PipelineMode) -> (TcpStream, AuthReply) {
    let mut socket = TcpStream::connect(addr).await.unwrap();
    let hello = AgentHello {
        secret: secret.to_string(),
        transport: TransportKind::Stream,
        version: PROTOCOL_VERSION,
        pipeline,
        metadata: AgentMetadata::default(),
    };
    let frame = Frame::auth(Bytes::from(hello.to_bytes().unwrap())).encode();
    let mut record = (frame.len() as u32).to_be_bytes().to_vec();
    record.extend_from_slice(&frame);
    socket.write_all(&record).await.unwrap();

    let mut len_buf = [0u8; 4];
    socket.read_exact(&mut len_buf).await.unwrap();
    let mut buf = vec![0u8; u32::from_be_bytes(len_buf) as usize];
    socket.read_exact(&mut buf).await.unwrap();
    let frame = Frame::decode(Bytes::from(buf)).unwrap();
    assert_eq!(frame.kind, FrameKind::Auth);
    let reply = AuthReply::from_bytes(&frame.payload).unwrap();
    (socket, reply)
}

/// Connect an agent that dials whatever target each open request names
async fn connect_serving_agent(
    addr: SocketAddr,
    secret: &str,
    pipeline: PipelineMode,
) -> Arc<MuxConnection> {
    let (socket, reply) = handshake(addr, secret, pipeline).await;
    let session_nonce = match reply {
        AuthReply::Accepted { session_nonce, .. } => session_nonce,
        AuthReply::Rejected { reason } => panic!("handshake rejected: {}", reason),
    };
    let key = derive_session_key(secret, &session_nonce);

    let mux = Arc::new(MuxConnection::start(
        socket,
        MuxRole::Listener,
        Pipeline::negotiated(pipeline, Some(&key), Direction::AgentToBridge).unwrap(),
        Pipeline::negotiated(pipeline, Some(&key), Direction::AgentToBridge).unwrap(),
        MuxConfig::default(),
    ));

    let accept_mux = mux.clone();
    tokio::spawn(async move {
        while let Some((request, stream)) = accept_mux.accept().await {
            tokio::spawn(async move {
                let target = TcpStream::connect(&request.target).await.unwrap();
                let seal = StreamSeal::negotiated(
                    request.pipeline,
                    &key,
                    stream.id(),
                    Direction::AgentToBridge,
                )
                .unwrap();
                let _ = relay(stream, target, seal).await;
            });
        }
    });

    mux
}

/// Echo server on an ephemeral port; returns "127.0.0.1:port"
async fn start_echo_target() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (mut socket, _) = match listener.accept().await {
                Ok(pair) => pair,
                Err(_) => return,
            };
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            if socket.write_all(&buf[..n]).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }
    });
    addr.to_string()
}

#[tokio::test]
async fn tcp_tunnel_end_to_end() {
    let target = start_echo_target().await;
    let public_port = free_port();
    let harness = start_server(
        ServerConfig::default(),
        vec![tcp_tunnel("echo", public_port, &target)],
    )
    .await;

    let _agent = connect_serving_agent(harness.bridge_addr, "verify-key-1", PipelineMode::None).await;
    sleep(Duration::from_millis(100)).await;

    let mut client = TcpStream::connect(("127.0.0.1", public_port)).await.unwrap();
    client.write_all(b"through the burrow").await.unwrap();
    let mut reply = [0u8; 18];
    timeout(Duration::from_secs(5), client.read_exact(&mut reply))
        .await
        .expect("echo reply in time")
        .unwrap();
    assert_eq!(&reply, b"through the burrow");
}

#[tokio::test]
async fn encrypted_session_end_to_end() {
    let target = start_echo_target().await;
    let public_port = free_port();
    let harness = start_server(
        ServerConfig::default(),
        vec![tcp_tunnel("echo", public_port, &target)],
    )
    .await;

    let _agent = connect_serving_agent(harness.bridge_addr, "verify-key-1", PipelineMode::Both).await;
    sleep(Duration::from_millis(100)).await;

    let mut client = TcpStream::connect(("127.0.0.1", public_port)).await.unwrap();
    client.write_all(b"sealed hop").await.unwrap();
    let mut reply = [0u8; 10];
    timeout(Duration::from_secs(5), client.read_exact(&mut reply))
        .await
        .expect("echo reply in time")
        .unwrap();
    assert_eq!(&reply, b"sealed hop");
}

#[tokio::test]
async fn bad_secret_is_rejected() {
    let harness = start_server(ServerConfig::default(), vec![]).await;

    let (_socket, reply) = handshake(harness.bridge_addr, "wrong-key", PipelineMode::None).await;
    assert!(matches!(
        reply,
        AuthReply::Rejected {
            reason: AuthRejectReason::BadSecret
        }
    ));
}

#[tokio::test]
async fn silent_client_hits_handshake_timeout() {
    let config = ServerConfig {
        timeouts: burrow_server::TimeoutConfig {
            handshake_secs: 1,
            ..Default::default()
        },
        ..Default::default()
    };
    let harness = start_server(config, vec![]).await;

    let mut socket = TcpStream::connect(harness.bridge_addr).await.unwrap();
    // Say nothing; the bridge must hang up on its own
    let mut buf = [0u8; 1];
    let n = timeout(Duration::from_secs(3), socket.read(&mut buf))
        .await
        .expect("bridge should close the connection")
        .unwrap();
    assert_eq!(n, 0);
}

#[tokio::test]
async fn public_connection_without_agent_closes_fast() {
    let public_port = free_port();
    let harness = start_server(
        ServerConfig::default(),
        vec![tcp_tunnel("echo", public_port, "127.0.0.1:1")],
    )
    .await;
    assert_eq!(harness.manager.len(), 0);

    let mut client = TcpStream::connect(("127.0.0.1", public_port)).await.unwrap();
    let mut buf = [0u8; 1];
    let n = timeout(Duration::from_secs(3), client.read(&mut buf))
        .await
        .expect("connection should close instead of hanging")
        .unwrap();
    assert_eq!(n, 0);
}

#[tokio::test]
async fn disconnected_agent_means_no_route() {
    let target = start_echo_target().await;
    let public_port = free_port();
    let harness = start_server(
        ServerConfig::default(),
        vec![tcp_tunnel("echo", public_port, &target)],
    )
    .await;

    let agent = connect_serving_agent(harness.bridge_addr, "verify-key-1", PipelineMode::None).await;
    sleep(Duration::from_millis(100)).await;
    assert_eq!(harness.manager.len(), 1);

    agent.close("test disconnect");
    sleep(Duration::from_millis(300)).await;

    let mut client = TcpStream::connect(("127.0.0.1", public_port)).await.unwrap();
    let mut buf = [0u8; 1];
    let n = timeout(Duration::from_secs(3), client.read(&mut buf))
        .await
        .expect("tunnel without its agent should refuse, not hang")
        .unwrap();
    assert_eq!(n, 0);
}

#[tokio::test]
async fn socks5_connect_through_tunnel() {
    let target = start_echo_target().await;
    let public_port = free_port();
    let socks_tunnel = Tunnel {
        mode: burrow_proto::TunnelMode::Socks5 {
            bind_port: public_port,
        },
        target: String::new(),
        ..tcp_tunnel("proxy", 0, "")
    };
    let harness = start_server(ServerConfig::default(), vec![socks_tunnel]).await;
    let _agent = connect_serving_agent(harness.bridge_addr, "verify-key-1", PipelineMode::None).await;
    sleep(Duration::from_millis(100)).await;

    let mut client = TcpStream::connect(("127.0.0.1", public_port)).await.unwrap();

    // Greeting: no-auth
    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut method = [0u8; 2];
    client.read_exact(&mut method).await.unwrap();
    assert_eq!(method, [0x05, 0x00]);

    // CONNECT to the echo target by IPv4 address
    let target_addr: SocketAddr = target.parse().unwrap();
    let ip = match target_addr.ip() {
        std::net::IpAddr::V4(ip) => ip.octets(),
        _ => unreachable!(),
    };
    let mut request = vec![0x05, 0x01, 0x00, 0x01];
    request.extend_from_slice(&ip);
    request.extend_from_slice(&target_addr.port().to_be_bytes());
    client.write_all(&request).await.unwrap();

    let mut reply = [0u8; 10];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[1], 0x00, "connect should succeed");

    client.write_all(b"proxied").await.unwrap();
    let mut echoed = [0u8; 7];
    timeout(Duration::from_secs(5), client.read_exact(&mut echoed))
        .await
        .expect("echo through socks in time")
        .unwrap();
    assert_eq!(&echoed, b"proxied");
}

#[tokio::test]
async fn http_routes_by_host_and_rejects_unknown() {
    let target = start_echo_target().await;
    let http_port = free_port();
    let http_tunnel = Tunnel {
        mode: burrow_proto::TunnelMode::Http {
            host: "app.example.com".to_string(),
            path_prefix: "/".to_string(),
        },
        ..tcp_tunnel("web", 0, &target)
    };
    let config = ServerConfig {
        http_bind: Some(format!("127.0.0.1:{}", http_port).parse().unwrap()),
        ..Default::default()
    };
    let harness = start_server(config, vec![http_tunnel]).await;
    let _agent = connect_serving_agent(harness.bridge_addr, "verify-key-1", PipelineMode::None).await;
    sleep(Duration::from_millis(100)).await;

    // Unknown host gets a 404 from the bridge itself
    let mut client = TcpStream::connect(("127.0.0.1", http_port)).await.unwrap();
    client
        .write_all(b"GET / HTTP/1.1\r\nHost: nobody.example.com\r\n\r\n")
        .await
        .unwrap();
    let mut response = Vec::new();
    client.read_to_end(&mut response).await.unwrap();
    assert!(String::from_utf8_lossy(&response).starts_with("HTTP/1.1 404"));

    // Known host reaches the echo target, which mirrors the raw request
    let mut client = TcpStream::connect(("127.0.0.1", http_port)).await.unwrap();
    let request = b"GET /hello HTTP/1.1\r\nHost: app.example.com\r\n\r\n";
    client.write_all(request).await.unwrap();
    let mut echoed = vec![0u8; request.len()];
    timeout(Duration::from_secs(5), client.read_exact(&mut echoed))
        .await
        .expect("request should reach the target")
        .unwrap();
    assert_eq!(&echoed, request);
}

#[tokio::test]
async fn removing_tunnel_frees_public_port() {
    let target = start_echo_target().await;
    let public_port = free_port();
    let harness = start_server(
        ServerConfig::default(),
        vec![tcp_tunnel("echo", public_port, &target)],
    )
    .await;
    let _agent = connect_serving_agent(harness.bridge_addr, "verify-key-1", PipelineMode::None).await;
    sleep(Duration::from_millis(100)).await;

    harness.tunnels.remove("echo").unwrap();
    sleep(Duration::from_millis(300)).await;

    // The dispatcher drained; nothing is listening any more
    assert!(TcpStream::connect(("127.0.0.1", public_port)).await.is_err());
}

#[tokio::test]
async fn removing_tunnel_drains_open_streams() {
    let target = start_echo_target().await;
    let public_port = free_port();
    let harness = start_server(
        ServerConfig::default(),
        vec![tcp_tunnel("echo", public_port, &target)],
    )
    .await;
    let _agent = connect_serving_agent(harness.bridge_addr, "verify-key-1", PipelineMode::None).await;
    sleep(Duration::from_millis(100)).await;

    let mut client = TcpStream::connect(("127.0.0.1", public_port)).await.unwrap();
    client.write_all(b"before").await.unwrap();
    let mut reply = [0u8; 6];
    timeout(Duration::from_secs(5), client.read_exact(&mut reply))
        .await
        .expect("echo before removal")
        .unwrap();
    assert_eq!(&reply, b"before");

    harness.tunnels.remove("echo").unwrap();
    sleep(Duration::from_millis(500)).await;

    // The established connection must be gone too, not just the listener
    let _ = client.write_all(b"after-removal").await;
    let mut buf = [0u8; 16];
    let outcome = timeout(Duration::from_secs(3), client.read(&mut buf))
        .await
        .expect("drained connection should close, not hang");
    match outcome {
        Ok(0) | Err(_) => {}
        Ok(n) => panic!("stream survived tunnel removal: read {} bytes", n),
    }
}
