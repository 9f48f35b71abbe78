//! Agent session tests against a scripted bridge peer

use burrow_agent::{AgentConfig, AgentSession, AgentStatus};
use burrow_mux::{MuxConfig, MuxConnection, MuxRole};
use burrow_pipeline::{Direction, Pipeline};
use burrow_proto::{
    AgentHello, AuthRejectReason, AuthReply, Frame, FrameKind, OpenRequest, PipelineMode,
    TransportKind, MAX_RECORD_SIZE,
};
use bytes::Bytes;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

const SECRET: &str = "verify-key-1";
const NONCE: [u8; 16] = [7u8; 16];

async fn read_record(socket: &mut TcpStream) -> Vec<u8> {
    let mut len_buf = [0u8; 4];
    socket.read_exact(&mut len_buf).await.unwrap();
    let len = u32::from_be_bytes(len_buf);
    assert!(len <= MAX_RECORD_SIZE);
    let mut buf = vec![0u8; len as usize];
    socket.read_exact(&mut buf).await.unwrap();
    buf
}

async fn write_record(socket: &mut TcpStream, frame: &Frame) {
    let encoded = frame.encode();
    let mut record = Vec::with_capacity(4 + encoded.len());
    record.extend_from_slice(&(encoded.len() as u32).to_be_bytes());
    record.extend_from_slice(&encoded);
    socket.write_all(&record).await.unwrap();
}

/// Accept one agent, check its hello, and answer
async fn accept_handshake(listener: &TcpListener, reply: AuthReply) -> (TcpStream, AgentHello) {
    let (mut socket, _) = listener.accept().await.unwrap();
    let record = read_record(&mut socket).await;
    let frame = Frame::decode(Bytes::from(record)).unwrap();
    assert_eq!(frame.kind, FrameKind::Auth);
    let hello = AgentHello::from_bytes(&frame.payload).unwrap();

    let payload = reply.to_bytes().unwrap();
    write_record(&mut socket, &Frame::auth(Bytes::from(payload))).await;
    (socket, hello)
}

fn accepted_reply() -> AuthReply {
    AuthReply::Accepted {
        agent_id: "agent-1".to_string(),
        session_nonce: NONCE,
        version: 1,
    }
}

async fn start_echo_target() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (mut socket, _) = listener.accept().await.unwrap();
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if socket.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

#[tokio::test]
async fn test_agent_serves_tcp_stream() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let bridge_addr = listener.local_addr().unwrap();
    let echo_addr = start_echo_target().await;

    let handle = AgentSession::start(AgentConfig::new(bridge_addr.to_string(), SECRET)).unwrap();

    let (socket, hello) = accept_handshake(&listener, accepted_reply()).await;
    assert_eq!(hello.secret, SECRET);

    let plain_out = Pipeline::negotiated(PipelineMode::None, None, Direction::BridgeToAgent).unwrap();
    let plain_in = Pipeline::negotiated(PipelineMode::None, None, Direction::BridgeToAgent).unwrap();
    let mux = MuxConnection::start(
        socket,
        MuxRole::Dialer,
        plain_out,
        plain_in,
        MuxConfig::default(),
    );

    let request = OpenRequest {
        tunnel_id: "web".to_string(),
        target: echo_addr.to_string(),
        protocol: TransportKind::Stream,
        pipeline: PipelineMode::None,
    };
    let mut stream = timeout(Duration::from_secs(5), mux.open_stream(&request))
        .await
        .unwrap()
        .unwrap();

    stream.send(b"over the wire").await.unwrap();
    let echoed = timeout(Duration::from_secs(5), stream.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&echoed[..], b"over the wire");

    assert_eq!(handle.status(), AgentStatus::Connected);
    handle.stop().await;
    assert_eq!(handle.status(), AgentStatus::Idle);
}

#[tokio::test]
async fn test_bad_secret_stops_the_session() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let bridge_addr = listener.local_addr().unwrap();

    let handle = AgentSession::start(AgentConfig::new(bridge_addr.to_string(), "wrong")).unwrap();

    let reply = AuthReply::Rejected {
        reason: AuthRejectReason::BadSecret,
    };
    let (_socket, _) = accept_handshake(&listener, reply).await;

    timeout(Duration::from_secs(5), handle.done()).await.unwrap();
    assert_eq!(handle.status(), AgentStatus::Error);
    assert!(handle
        .recent_log()
        .iter()
        .any(|line| line.contains("fatal")));
}

#[tokio::test]
async fn test_agent_reconnects_after_connection_drop() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let bridge_addr = listener.local_addr().unwrap();

    let handle = AgentSession::start(AgentConfig::new(bridge_addr.to_string(), SECRET)).unwrap();

    // First session is cut short by dropping the socket
    let (socket, _) = accept_handshake(&listener, accepted_reply()).await;
    drop(socket);

    // The agent comes back on its own and completes a second handshake
    let (_socket, hello) = timeout(
        Duration::from_secs(10),
        accept_handshake(&listener, accepted_reply()),
    )
    .await
    .unwrap();
    assert_eq!(hello.secret, SECRET);

    timeout(Duration::from_secs(5), async {
        loop {
            if handle.status() == AgentStatus::Connected {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();

    handle.stop().await;
}

#[tokio::test]
async fn test_quota_rejection_keeps_retrying() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let bridge_addr = listener.local_addr().unwrap();

    let mut config = AgentConfig::new(bridge_addr.to_string(), SECRET);
    config.reconnect.max_attempts = Some(2);

    let handle = AgentSession::start(config).unwrap();

    let reply = AuthReply::Rejected {
        reason: AuthRejectReason::QuotaExceeded,
    };
    let (_first, _) = accept_handshake(&listener, reply.clone()).await;
    // A second attempt proves quota rejection is not terminal
    let (_second, _) = timeout(
        Duration::from_secs(10),
        accept_handshake(&listener, reply),
    )
    .await
    .unwrap();

    timeout(Duration::from_secs(10), handle.done()).await.unwrap();
    assert_eq!(handle.status(), AgentStatus::Error);
}
