//! Shared helpers for the integration suite

pub mod bedrock_session;
pub mod events;
pub mod hot_reload;
pub mod java_routing;
pub mod proxy_protocol;
pub mod traffic_limiter;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use craft_router::config::load_config_str;
use craft_router::event::EventBus;
use craft_router::proxy::ProxySet;
use craft_router::Edition;

/// Bring up a proxy set from a YAML document and return it with the
/// first Java listener's bound address.
pub async fn start_proxy(yaml: &str, bus: EventBus) -> (Arc<ProxySet>, SocketAddr) {
    let config = load_config_str(yaml).expect("test config must parse");
    let set = Arc::new(ProxySet::new(bus));
    set.apply_config(&config).await.expect("proxy must start");
    let addr = set
        .get(Edition::Java)
        .listener_addrs()
        .first()
        .copied()
        .expect("a java listener");
    (set, addr)
}

/// A TCP upstream that records everything each accepted connection
/// sends, delivering one byte vector per connection on the channel.
pub async fn spawn_recording_upstream() -> (SocketAddr, mpsc::UnboundedReceiver<Vec<u8>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut received = Vec::new();
                let mut buf = [0u8; 4096];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => received.extend_from_slice(&buf[..n]),
                    }
                }
                let _ = tx.send(received);
            });
        }
    });
    (addr, rx)
}

// ============================================================================
// Java packet building, mirroring the wire format under test
// ============================================================================

pub fn write_varint(out: &mut Vec<u8>, mut value: u32) {
    loop {
        let b = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(b);
            return;
        }
        out.push(b | 0x80);
    }
}

pub fn frame_packet(id: u32, payload: &[u8]) -> Vec<u8> {
    let mut body = Vec::new();
    write_varint(&mut body, id);
    body.extend_from_slice(payload);
    let mut framed = Vec::new();
    write_varint(&mut framed, body.len() as u32);
    framed.extend_from_slice(&body);
    framed
}

/// The serverbound handshake: protocol, host, port, next state.
pub fn handshake_packet(protocol: u32, host: &str, port: u16, next_state: u32) -> Vec<u8> {
    let mut payload = Vec::new();
    write_varint(&mut payload, protocol);
    write_varint(&mut payload, host.len() as u32);
    payload.extend_from_slice(host.as_bytes());
    payload.extend_from_slice(&port.to_be_bytes());
    write_varint(&mut payload, next_state);
    frame_packet(0x00, &payload)
}

pub fn login_start_packet(username: &str) -> Vec<u8> {
    let mut payload = Vec::new();
    write_varint(&mut payload, username.len() as u32);
    payload.extend_from_slice(username.as_bytes());
    frame_packet(0x00, &payload)
}

pub fn status_request_packet() -> Vec<u8> {
    frame_packet(0x00, &[])
}

/// Read one framed packet: (packet id, payload bytes).
pub async fn read_packet<R: tokio::io::AsyncRead + Unpin>(stream: &mut R) -> (u32, Vec<u8>) {
    let length = read_varint_async(stream).await;
    let mut body = vec![0u8; length as usize];
    stream.read_exact(&mut body).await.unwrap();
    let mut idx = 0;
    let id = read_varint_slice(&body, &mut idx);
    (id, body[idx..].to_vec())
}

pub async fn read_varint_async<R: tokio::io::AsyncRead + Unpin>(stream: &mut R) -> u32 {
    let mut value = 0u32;
    let mut shift = 0;
    loop {
        let b = stream.read_u8().await.unwrap();
        value |= u32::from(b & 0x7f) << shift;
        if b & 0x80 == 0 {
            return value;
        }
        shift += 7;
    }
}

pub fn read_varint_slice(data: &[u8], idx: &mut usize) -> u32 {
    let mut value = 0u32;
    let mut shift = 0;
    loop {
        let b = data[*idx];
        *idx += 1;
        value |= u32::from(b & 0x7f) << shift;
        if b & 0x80 == 0 {
            return value;
        }
        shift += 7;
    }
}

/// Extract the string payload of a packet whose body is one string.
pub fn packet_string(payload: &[u8]) -> String {
    let mut idx = 0;
    let len = read_varint_slice(payload, &mut idx) as usize;
    String::from_utf8_lossy(&payload[idx..idx + len]).into_owned()
}
