//! Event ordering across a connection's lifetime.

use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use craft_router::event::{Event, EventBus};

use super::{handshake_packet, login_start_packet, spawn_recording_upstream, start_proxy};

async fn drain_events(
    rx: &mut tokio::sync::mpsc::Receiver<Event>,
    until_leave: bool,
) -> Vec<&'static str> {
    let mut topics = Vec::new();
    loop {
        match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
            Ok(Some(event)) => {
                let topic = event.topic();
                topics.push(topic);
                if until_leave && topic == "PlayerLeave" {
                    return topics;
                }
            }
            _ => return topics,
        }
    }
}

/// A forwarded connection emits the full monotonic chain, with exactly
/// one PlayerLeave.
#[tokio::test]
async fn forwarded_connection_emits_ordered_events() {
    let (upstream_addr, _received) = spawn_recording_upstream().await;
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
    let bus = EventBus::new();
    let mut events = bus.subscribe_async("test-observer");
    let (_set, addr) = start_proxy(&yaml, bus).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    client
        .write_all(&handshake_packet(765, "play.example.com", 25565, 2))
        .await
        .unwrap();
    client.write_all(&login_start_packet("Alice")).await.unwrap();
    client.shutdown().await.unwrap();

    let topics = drain_events(&mut events, true).await;
    assert_eq!(
        topics,
        vec![
            "PreLogin",
            "PreConnConnecting",
            "PostLogin",
            "PlayerJoin",
            "PlayerLeave"
        ]
    );
}

/// An unmatched connection never announces an upstream, but still
/// leaves exactly once.
#[tokio::test]
async fn unmatched_connection_skips_upstream_events() {
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
    let bus = EventBus::new();
    let mut events = bus.subscribe_async("test-observer");
    let (_set, addr) = start_proxy(yaml, bus).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    client
        .write_all(&handshake_packet(765, "unknown.example.com", 25565, 1))
        .await
        .unwrap();

    let topics = drain_events(&mut events, true).await;
    assert_eq!(topics, vec!["PreLogin", "PlayerLeave"]);
}

/// PlayerLeave carries the username and byte counters of the session.
#[tokio::test]
async fn player_leave_reports_counters() {
    let (upstream_addr, _received) = spawn_recording_upstream().await;
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
    let bus = EventBus::new();
    let mut events = bus.subscribe_async("test-observer");
    let (_set, addr) = start_proxy(&yaml, bus).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    client
        .write_all(&handshake_packet(765, "play.example.com", 25565, 2))
        .await
        .unwrap();
    client.write_all(&login_start_packet("Alice")).await.unwrap();
    client.write_all(&[0u8; 64]).await.unwrap();
    client.shutdown().await.unwrap();

    loop {
        match tokio::time::timeout(Duration::from_secs(5), events.recv()).await {
            Ok(Some(Event::PlayerLeave {
                conn,
                bytes_up,
                ..
            })) => {
                assert_eq!(conn.username.as_deref(), Some("Alice"));
                // The 64 pumped bytes; the prelude is replayed, not pumped.
                assert_eq!(bytes_up, 64);
                return;
            }
            Ok(Some(_)) => continue,
            _ => panic!("no PlayerLeave received"),
        }
    }
}
