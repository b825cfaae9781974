//! PROXY protocol: trusted-peer header consumption on the inbound
//! side and v2 emission toward upstreams.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use craft_router::event::{Event, EventBus};
use craft_router::proxy_protocol::encode_v2;

use super::{handshake_packet, login_start_packet, spawn_recording_upstream, start_proxy};

/// A trusted peer's PROXY header replaces the observed remote address.
#[tokio::test]
async fn trusted_peer_header_rewrites_remote_addr() {
    let (upstream_addr, _received) = spawn_recording_upstream().await;
    let yaml = format!(
        r#"
java:
  listeners:
    - id: main
      bind: 127.0.0.1:0
      receive_proxy_protocol: true
      trusted_proxy_cidrs: ["127.0.0.0/8"]
  servers:
    - id: lobby
      domains: ["*"]
      addresses: ["{upstream_addr}"]
"#
    );
    let bus = EventBus::new();
    let mut events = bus.subscribe_async("observer");
    let (_set, addr) = start_proxy(&yaml, bus).await;

    let declared_source: std::net::SocketAddr = "198.51.100.7:40000".parse().unwrap();
    let mut client = TcpStream::connect(addr).await.unwrap();
    client
        .write_all(&encode_v2(declared_source, addr, false))
        .await
        .unwrap();
    client
        .write_all(&handshake_packet(765, "play.example.com", 25565, 1))
        .await
        .unwrap();

    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("an event")
            .expect("bus alive");
        if let Event::PreLogin { conn } = event {
            assert_eq!(conn.remote_addr, declared_source);
            return;
        }
    }
}

/// An untrusted peer's bytes are not interpreted as a PROXY header:
/// the handshake parse starts at byte 0 and still succeeds.
#[tokio::test]
async fn untrusted_peer_skips_header_parse() {
    let (upstream_addr, mut received) = spawn_recording_upstream().await;
    let yaml = format!(
        r#"
java:
  listeners:
    - id: main
      bind: 127.0.0.1:0
      receive_proxy_protocol: true
      trusted_proxy_cidrs: ["10.0.0.0/8"]
  servers:
    - id: lobby
      domains: ["*"]
      addresses: ["{upstream_addr}"]
"#
    );
    let (_set, addr) = start_proxy(&yaml, EventBus::new()).await;

    // 127.0.0.1 is not in the trusted range: a plain handshake must
    // pass through untouched.
    let mut client = TcpStream::connect(addr).await.unwrap();
    let sent = handshake_packet(765, "play.example.com", 25565, 1);
    client.write_all(&sent).await.unwrap();
    client.shutdown().await.unwrap();

    let upstream_bytes = tokio::time::timeout(Duration::from_secs(5), received.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(upstream_bytes, sent);
}

/// A trusted peer that sends garbage instead of a header loses the
/// connection.
#[tokio::test]
async fn trusted_peer_with_bad_header_is_dropped() {
    let (upstream_addr, mut received) = spawn_recording_upstream().await;
    let yaml = format!(
        r#"
java:
  listeners:
    - id: main
      bind: 127.0.0.1:0
      receive_proxy_protocol: true
      trusted_proxy_cidrs: ["127.0.0.0/8"]
  servers:
    - id: lobby
      domains: ["*"]
      addresses: ["{upstream_addr}"]
"#
    );
    let (_set, addr) = start_proxy(&yaml, EventBus::new()).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    // A handshake is not a PROXY header; the trusted peer promised one.
    client
        .write_all(&handshake_packet(765, "play.example.com", 25565, 1))
        .await
        .unwrap();

    let mut rest = Vec::new();
    let n = tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut rest))
        .await
        .expect("connection should close")
        .unwrap();
    assert_eq!(n, 0);
    assert!(received.try_recv().is_err(), "upstream must not be dialed");
}

/// `send_proxy_protocol` prepends a v2 header carrying the client's
/// address, before the verbatim prelude.
#[tokio::test]
async fn upstream_receives_v2_header_then_prelude() {
    let (upstream_addr, mut received) = spawn_recording_upstream().await;
    let yaml = format!(
        r#"
java:
  listeners:
    - id: main
      bind: 127.0.0.1:0
  servers:
    - id: lobby
      domains: ["*"]
      addresses: ["{upstream_addr}"]
      send_proxy_protocol: true
"#
    );
    let (_set, addr) = start_proxy(&yaml, EventBus::new()).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    let local = client.local_addr().unwrap();
    let mut sent = handshake_packet(765, "play.example.com", 25565, 2);
    sent.extend_from_slice(&login_start_packet("Alice"));
    client.write_all(&sent).await.unwrap();
    client.shutdown().await.unwrap();

    let upstream_bytes = tokio::time::timeout(Duration::from_secs(5), received.recv())
        .await
        .unwrap()
        .unwrap();

    let expected_header = encode_v2(local, upstream_addr, false);
    assert!(upstream_bytes.len() > expected_header.len());
    assert_eq!(&upstream_bytes[..expected_header.len()], &expected_header);
    assert_eq!(&upstream_bytes[expected_header.len()..], &sent);
}
