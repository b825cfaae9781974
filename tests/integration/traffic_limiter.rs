//! Traffic limiter plugin: the burst-exceeding connection is vetoed
//! before any upstream contact and receives the limiter's message.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use craft_router::config::load_config_str;
use craft_router::event::EventBus;
use craft_router::plugin::{PluginApi, PluginManager};
use craft_router::proxy::ProxySet;
use craft_router::Edition;

use super::{handshake_packet, login_start_packet, packet_string, read_packet};

#[tokio::test]
async fn eleventh_connection_is_vetoed() {
    let (upstream_addr, _received) = super::spawn_recording_upstream().await;
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
plugins:
  traffic_limiter:
    enabled: true
    rate_per_second: 1
    burst: 10
    message: rate limited
"#
    );
    let config = load_config_str(&yaml).unwrap();

    let bus = EventBus::new();
    let proxies = Arc::new(ProxySet::new(bus.clone()));
    let mut plugins = PluginManager::with_builtin(PluginApi::new(bus.clone(), proxies.clone()));
    plugins.load_all(&config).await.unwrap();
    proxies.apply_config(&config).await.unwrap();
    plugins.enable_all().await.unwrap();

    let addr = proxies.get(Edition::Java).listener_addrs()[0];

    // Ten connections fit the burst. Each is driven to completion so
    // its token is definitely consumed before the next begins.
    for i in 0..10 {
        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(&handshake_packet(765, "play.example.com", 25565, 2))
            .await
            .unwrap();
        client
            .write_all(&login_start_packet(&format!("player{i}")))
            .await
            .unwrap();
        client.shutdown().await.unwrap();
        let mut drained = Vec::new();
        let _ = tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut drained)).await;
    }

    // The eleventh is disconnected with the limiter's message.
    let mut client = TcpStream::connect(addr).await.unwrap();
    client
        .write_all(&handshake_packet(765, "play.example.com", 25565, 2))
        .await
        .unwrap();
    client
        .write_all(&login_start_packet("player10"))
        .await
        .unwrap();

    let (id, payload) = tokio::time::timeout(Duration::from_secs(5), read_packet(&mut client))
        .await
        .expect("a disconnect packet");
    assert_eq!(id, 0x00);
    let reason = packet_string(&payload);
    assert!(
        reason.contains("rate limited"),
        "unexpected disconnect reason: {reason}"
    );

    plugins.disable_all().await;
}

#[tokio::test]
async fn disabled_limiter_lets_everything_through() {
    let (upstream_addr, mut received) = super::spawn_recording_upstream().await;
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
plugins:
  traffic_limiter:
    enabled: false
"#
    );
    let config = load_config_str(&yaml).unwrap();

    let bus = EventBus::new();
    let proxies = Arc::new(ProxySet::new(bus.clone()));
    let mut plugins = PluginManager::with_builtin(PluginApi::new(bus.clone(), proxies.clone()));
    plugins.load_all(&config).await.unwrap();
    proxies.apply_config(&config).await.unwrap();
    plugins.enable_all().await.unwrap();

    let addr = proxies.get(Edition::Java).listener_addrs()[0];
    for _ in 0..30 {
        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(&handshake_packet(765, "play.example.com", 25565, 1))
            .await
            .unwrap();
        client.shutdown().await.unwrap();
        let bytes = tokio::time::timeout(Duration::from_secs(5), received.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(!bytes.is_empty());
    }

    plugins.disable_all().await;
}
