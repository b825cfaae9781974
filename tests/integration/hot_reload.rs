//! Hot reload: new connections see the new table, in-flight
//! connections keep the one they matched against.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use craft_router::config::load_config_str;
use craft_router::event::EventBus;

use super::{handshake_packet, login_start_packet, spawn_recording_upstream, start_proxy};

fn config_yaml(upstream: std::net::SocketAddr) -> String {
    format!(
        r#"
java:
  listeners:
    - id: main
      bind: 127.0.0.1:0
  servers:
    - id: lobby
      domains: ["*"]
      addresses: ["{upstream}"]
"#
    )
}

#[tokio::test]
async fn reload_pins_inflight_and_routes_new_connections() {
    let (addr_a, mut received_a) = spawn_recording_upstream().await;
    let (addr_b, mut received_b) = spawn_recording_upstream().await;

    let bus = EventBus::new();
    let mut events = bus.subscribe_async("reload-observer");
    let (set, addr) = start_proxy(&config_yaml(addr_a), bus).await;

    // First connection matches while table v1 (target A) is current.
    let mut first = TcpStream::connect(addr).await.unwrap();
    first
        .write_all(&handshake_packet(765, "play.example.com", 25565, 2))
        .await
        .unwrap();
    first.write_all(&login_start_packet("Alice")).await.unwrap();
    first.write_all(b"before-reload").await.unwrap();

    // The match has definitely happened once the splice starts.
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("join event")
            .expect("bus alive");
        if event.topic() == "PlayerJoin" {
            break;
        }
    }

    // Swap the table: same host now routes to B.
    let new_config = load_config_str(&config_yaml(addr_b)).unwrap();
    set.apply_config(&new_config).await.unwrap();

    // The in-flight connection keeps streaming to A.
    first.write_all(b"|after-reload").await.unwrap();
    first.shutdown().await.unwrap();

    // A second connection goes to B.
    let mut second = TcpStream::connect(addr).await.unwrap();
    let mut sent_second = handshake_packet(765, "play.example.com", 25565, 2);
    sent_second.extend_from_slice(&login_start_packet("Bob"));
    second.write_all(&sent_second).await.unwrap();
    second.shutdown().await.unwrap();

    let a_bytes = tokio::time::timeout(Duration::from_secs(5), received_a.recv())
        .await
        .unwrap()
        .unwrap();
    let a_text = String::from_utf8_lossy(&a_bytes);
    assert!(a_text.contains("before-reload"));
    assert!(
        a_text.contains("after-reload"),
        "in-flight connection must keep its pre-reload route"
    );

    let b_bytes = tokio::time::timeout(Duration::from_secs(5), received_b.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(String::from_utf8_lossy(&b_bytes).contains("Bob"));
}

/// The listener socket survives a reload that does not change its bind
/// address: a connection opened before the reload still reaches the
/// proxy afterwards.
#[tokio::test]
async fn reload_keeps_listener_socket() {
    let (addr_a, _received_a) = spawn_recording_upstream().await;
    let (addr_b, mut received_b) = spawn_recording_upstream().await;

    let (set, addr) = start_proxy(&config_yaml(addr_a), EventBus::new()).await;

    let new_config = load_config_str(&config_yaml(addr_b)).unwrap();
    set.apply_config(&new_config).await.unwrap();

    // The same bound address still accepts.
    let mut client = TcpStream::connect(addr).await.unwrap();
    let mut sent = handshake_packet(765, "play.example.com", 25565, 2);
    sent.extend_from_slice(&login_start_packet("Carol"));
    client.write_all(&sent).await.unwrap();
    client.shutdown().await.unwrap();
    let mut eof = Vec::new();
    let _ = client.read_to_end(&mut eof).await;

    let b_bytes = tokio::time::timeout(Duration::from_secs(5), received_b.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(b_bytes, sent);
}

/// An invalid replacement config is rejected atomically: the prior
/// routes keep serving.
#[tokio::test]
async fn failed_reload_keeps_previous_config() {
    let (addr_a, mut received_a) = spawn_recording_upstream().await;
    let (set, addr) = start_proxy(&config_yaml(addr_a), EventBus::new()).await;

    // Parse failure happens before any state is touched.
    assert!(load_config_str("java: [broken").is_err());

    // A structurally valid but semantically broken config is rejected
    // by apply_config and leaves the old table active.
    let broken = r#"
java:
  listeners:
    - id: main
      bind: 127.0.0.1:0
  gateways:
    g1: { listeners: [main, missing] }
"#;
    let broken_config = load_config_str(broken);
    assert!(broken_config.is_err());

    let mut client = TcpStream::connect(addr).await.unwrap();
    let sent = handshake_packet(765, "play.example.com", 25565, 1);
    client.write_all(&sent).await.unwrap();
    client.shutdown().await.unwrap();

    let bytes = tokio::time::timeout(Duration::from_secs(5), received_a.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(bytes, sent);
    drop(set);
}
