//! Java routing end-to-end: status serving, forwarding with prelude
//! replay, silent no-match, and wildcard precedence.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use craft_router::event::EventBus;

use super::{
    handshake_packet, login_start_packet, packet_string, read_packet, spawn_recording_upstream,
    start_proxy, status_request_packet,
};

/// A status route answers with its configured JSON and echoes pings.
#[tokio::test]
async fn status_route_serves_offline_payload() {
    let yaml = r#"
java:
  listeners:
    - id: main
      bind: 127.0.0.1:0
  servers:
    - id: offline
      domains: ["play.example.com"]
      on_match_action: status
      offline_status:
        version: { name: "1.20.4", protocol: 765 }
        players: { max: 20, online: 0 }
        description: { text: "offline" }
"#;
    let (_set, addr) = start_proxy(yaml, EventBus::new()).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    client
        .write_all(&handshake_packet(765, "play.example.com", 25565, 1))
        .await
        .unwrap();
    client.write_all(&status_request_packet()).await.unwrap();

    let (id, payload) = read_packet(&mut client).await;
    assert_eq!(id, 0x00);
    let json: serde_json::Value = serde_json::from_str(&packet_string(&payload)).unwrap();
    assert_eq!(json["version"]["protocol"], 765);
    assert_eq!(json["players"]["max"], 20);
    assert_eq!(json["description"]["text"], "offline");

    // Ping is echoed back verbatim, then the proxy closes.
    let ping = super::frame_packet(0x01, &42u64.to_be_bytes());
    client.write_all(&ping).await.unwrap();
    let (id, payload) = read_packet(&mut client).await;
    assert_eq!(id, 0x01);
    assert_eq!(payload, 42u64.to_be_bytes());

    let mut rest = Vec::new();
    client.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());
}

/// A forwarded login connection replays the exact handshake bytes to
/// the upstream before any pumped byte.
#[tokio::test]
async fn forward_replays_prelude_verbatim() {
    let (upstream_addr, mut received) = spawn_recording_upstream().await;
    let yaml = format!(
        r#"
java:
  listeners:
    - id: main
      bind: 127.0.0.1:0
  servers:
    - id: lobby
      domains: ["play.example.com"]
      addresses: ["{upstream_addr}"]
"#
    );
    let (_set, addr) = start_proxy(&yaml, EventBus::new()).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    let mut sent = handshake_packet(765, "play.example.com", 25565, 2);
    sent.extend_from_slice(&login_start_packet("Alice"));
    client.write_all(&sent).await.unwrap();
    client.write_all(b"opaque game bytes").await.unwrap();
    client.shutdown().await.unwrap();

    let upstream_bytes = tokio::time::timeout(Duration::from_secs(5), received.recv())
        .await
        .unwrap()
        .unwrap();
    let mut expected = sent.clone();
    expected.extend_from_slice(b"opaque game bytes");
    assert_eq!(upstream_bytes, expected);
}

/// Bytes flow in both directions once spliced.
#[tokio::test]
async fn forward_pumps_both_directions() {
    let upstream_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = upstream_listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = upstream_listener.accept().await.unwrap();
        // Swallow the prelude, then speak.
        let mut prelude = vec![0u8; 1024];
        let _ = stream.read(&mut prelude).await.unwrap();
        stream.write_all(b"hello from upstream").await.unwrap();
    });

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
"#
    );
    let (_set, addr) = start_proxy(&yaml, EventBus::new()).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    let mut sent = handshake_packet(765, "anything.example.com", 25565, 2);
    sent.extend_from_slice(&login_start_packet("Alice"));
    client.write_all(&sent).await.unwrap();

    let mut reply = vec![0u8; b"hello from upstream".len()];
    tokio::time::timeout(Duration::from_secs(5), client.read_exact(&mut reply))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&reply, b"hello from upstream");
}

/// No matching route and no fallback payload: silent close.
#[tokio::test]
async fn unmatched_host_closes_silently() {
    let yaml = r#"
java:
  listeners:
    - id: main
      bind: 127.0.0.1:0
  servers:
    - id: only
      domains: ["play.example.com"]
      addresses: ["127.0.0.1:9"]
"#;
    let (_set, addr) = start_proxy(yaml, EventBus::new()).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    client
        .write_all(&handshake_packet(765, "unknown.example.com", 25565, 1))
        .await
        .unwrap();

    let mut rest = Vec::new();
    let n = tokio::time::timeout(Duration::from_millis(500), client.read_to_end(&mut rest))
        .await
        .expect("connection should close promptly")
        .unwrap();
    assert_eq!(n, 0);
}

/// Matching is case-insensitive on the requested host.
#[tokio::test]
async fn host_matching_is_case_insensitive() {
    let (upstream_addr, mut received) = spawn_recording_upstream().await;
    let yaml = format!(
        r#"
java:
  listeners:
    - id: main
      bind: 127.0.0.1:0
  servers:
    - id: lobby
      domains: ["mc.example.com"]
      addresses: ["{upstream_addr}"]
"#
    );
    let (_set, addr) = start_proxy(&yaml, EventBus::new()).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    let sent = handshake_packet(765, "MC.Example.COM", 25565, 1);
    client.write_all(&sent).await.unwrap();
    client.shutdown().await.unwrap();

    let upstream_bytes = tokio::time::timeout(Duration::from_secs(5), received.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(upstream_bytes, sent);
}

/// The more specific wildcard listed first wins over the catch-all.
#[tokio::test]
async fn wildcard_precedence_is_first_match() {
    let (addr_a, mut received_a) = spawn_recording_upstream().await;
    let (addr_b, mut received_b) = spawn_recording_upstream().await;
    let yaml = format!(
        r#"
java:
  listeners:
    - id: main
      bind: 127.0.0.1:0
  servers:
    - id: prod
      domains: ["*.prod.example.com"]
      addresses: ["{addr_a}"]
    - id: fallback
      domains: ["*"]
      addresses: ["{addr_b}"]
"#
    );
    let (_set, addr) = start_proxy(&yaml, EventBus::new()).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    client
        .write_all(&handshake_packet(765, "eu.prod.example.com", 25565, 1))
        .await
        .unwrap();
    client.shutdown().await.unwrap();

    let hit_a = tokio::time::timeout(Duration::from_secs(5), received_a.recv())
        .await
        .unwrap();
    assert!(hit_a.is_some(), "specific wildcard route must win");
    assert!(
        received_b.try_recv().is_err(),
        "catch-all must not be dialed"
    );
}
