//! End-to-end scenarios (§8) driven through a hand-rolled raw client —
//! masking/unmasking a client is explicitly out of scope for the library
//! itself (§1 Non-goals), so the test harness plays that role directly.

use bytes::BytesMut;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use wsforge::config::{AutoPingOptions, MessagingOptions, ServerOptions};
use wsforge::connection::ConnectionHandle;
use wsforge::frame::{self, OpCode};
use wsforge::handler::Handler;
use wsforge::server::Server;

struct EchoHandler;

impl Handler for EchoHandler {
    fn on_message(&self, conn: &ConnectionHandle, text: String) {
        let _ = conn.queue_text(text);
    }

    fn on_data(&self, conn: &ConnectionHandle, data: Vec<u8>) {
        let _ = conn.queue_binary(data);
    }
}

async fn handshake_client(port: u16) -> TcpStream {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let request = "GET / HTTP/1.1\r\n\
                   Host: 127.0.0.1\r\n\
                   Upgrade: websocket\r\n\
                   Connection: Upgrade\r\n\
                   Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
                   Sec-WebSocket-Version: 13\r\n\
                   \r\n";
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        stream.read_exact(&mut byte).await.unwrap();
        buf.push(byte[0]);
        if buf.ends_with(b"\r\n\r\n") {
            break;
        }
    }
    let response = String::from_utf8(buf).unwrap();
    assert!(response.starts_with("HTTP/1.1 101"));
    stream
}

fn mask_bytes(payload: &[u8], mask: [u8; 4]) -> Vec<u8> {
    payload
        .iter()
        .enumerate()
        .map(|(i, b)| b ^ mask[i % 4])
        .collect()
}

async fn send_masked_frame(stream: &mut TcpStream, opcode: OpCode, payload: &[u8], masked: bool) {
    let mut out = Vec::new();
    out.push(0x80 | opcode.as_u8());
    let len = payload.len();
    let mask_bit = if masked { 0x80 } else { 0x00 };
    if len <= 125 {
        out.push(mask_bit | len as u8);
    } else if len <= u16::MAX as usize {
        out.push(mask_bit | 126);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        out.push(mask_bit | 127);
        out.extend_from_slice(&(len as u64).to_be_bytes());
    }
    let mask = [0x11, 0x22, 0x33, 0x44];
    if masked {
        out.extend_from_slice(&mask);
        out.extend_from_slice(&mask_bytes(payload, mask));
    } else {
        out.extend_from_slice(payload);
    }
    stream.write_all(&out).await.unwrap();
}

async fn read_one_frame(stream: &mut TcpStream) -> Option<(OpCode, Vec<u8>)> {
    let mut buf = BytesMut::new();
    let mut tmp = [0u8; 4096];
    loop {
        if let Ok(Some((decoded, _))) = frame::decode_frame(&buf) {
            return Some((decoded.opcode, decoded.payload));
        }
        match stream.read(&mut tmp).await {
            Ok(0) => return None,
            Ok(n) => buf.extend_from_slice(&tmp[..n]),
            Err(_) => return None,
        }
    }
}

/// Reserves a free ephemeral port and starts the server bound to it.
/// `ServerOptions` carries a port number rather than an already-bound
/// listener, so the port has to be chosen before `Server::new`.
async fn bound_server(base_options: ServerOptions) -> (Server<EchoHandler>, u16) {
    let probe = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = probe.local_addr().unwrap().port();
    drop(probe);

    let options = ServerOptions {
        bind_address: "127.0.0.1".to_string(),
        bind_port: port,
        ..base_options
    };
    let server = Server::new(options, EchoHandler);
    server.start().await.expect("server starts");
    (server, port)
}

#[tokio::test]
async fn happy_path_echo() {
    let (server, port) = bound_server(ServerOptions::default()).await;
    let mut client = handshake_client(port).await;

    send_masked_frame(&mut client, OpCode::Text, b"hello", true).await;
    let (opcode, payload) = read_one_frame(&mut client).await.unwrap();
    assert_eq!(opcode, OpCode::Text);
    assert_eq!(payload, b"hello");

    server.stop().await.unwrap();
}

#[tokio::test]
async fn disconnect_phrase_closes_cleanly() {
    let (server, port) = bound_server(ServerOptions::default()).await;
    let mut client = handshake_client(port).await;

    send_masked_frame(&mut client, OpCode::Text, b"disconnect", true).await;
    let (opcode, payload) = read_one_frame(&mut client).await.unwrap();
    assert_eq!(opcode, OpCode::Close);
    assert_eq!(u16::from_be_bytes([payload[0], payload[1]]), 1000);

    assert!(read_one_frame(&mut client).await.is_none());
    server.stop().await.unwrap();
}

#[tokio::test]
async fn oversize_message_is_rejected() {
    let options = ServerOptions {
        messaging: MessagingOptions {
            max_message_receive_bytes: 16,
            ..Default::default()
        },
        ..Default::default()
    };
    let (server, port) = bound_server(options).await;
    let mut client = handshake_client(port).await;

    send_masked_frame(&mut client, OpCode::Binary, &vec![0xABu8; 4096], true).await;
    let (opcode, payload) = read_one_frame(&mut client).await.unwrap();
    assert_eq!(opcode, OpCode::Close);
    assert_eq!(u16::from_be_bytes([payload[0], payload[1]]), 1009);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn missing_mask_is_rejected() {
    let (server, port) = bound_server(ServerOptions::default()).await;
    let mut client = handshake_client(port).await;

    send_masked_frame(&mut client, OpCode::Text, b"not masked", false).await;
    let (opcode, payload) = read_one_frame(&mut client).await.unwrap();
    assert_eq!(opcode, OpCode::Close);
    assert_eq!(u16::from_be_bytes([payload[0], payload[1]]), 1002);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn auto_ping_timeout_disconnects_silent_peer() {
    let options = ServerOptions {
        auto_ping: AutoPingOptions {
            enabled: true,
            interval: Duration::from_millis(50),
            timeout: Duration::from_millis(50),
        },
        ..Default::default()
    };
    let (server, port) = bound_server(options).await;
    let mut client = handshake_client(port).await;

    // The client never replies to pings, so the pinger activity should
    // time out and tear the connection down.
    let (opcode, payload) = read_one_frame(&mut client).await.unwrap();
    assert_eq!(opcode, OpCode::Close);
    assert_eq!(u16::from_be_bytes([payload[0], payload[1]]), 1002);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn server_shutdown_disconnects_every_peer() {
    let (server, port) = bound_server(ServerOptions::default()).await;
    let mut client = handshake_client(port).await;

    server.stop().await.unwrap();

    let (opcode, payload) = read_one_frame(&mut client).await.unwrap();
    assert_eq!(opcode, OpCode::Close);
    assert_eq!(u16::from_be_bytes([payload[0], payload[1]]), 1001);
}
