//! Bedrock end-to-end: RakNet handshake against the proxy, login
//! parsing, routing, and prelude replay to a RakNet upstream.

use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;

use craft_router::bedrock::raknet::ID_GAME_PACKET;
use craft_router::bedrock::{session, RaknetListener};
use craft_router::event::EventBus;
use craft_router::Edition;

// ============================================================================
// Login payload building, mirroring the wire format under test
// ============================================================================

fn write_varuint(out: &mut BytesMut, mut value: u32) {
    loop {
        let b = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.put_u8(b);
            return;
        }
        out.put_u8(b | 0x80);
    }
}

fn fake_jwt(claims: &serde_json::Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"ES384","x5u":"test"}"#);
    let body = URL_SAFE_NO_PAD.encode(claims.to_string().as_bytes());
    let signature = URL_SAFE_NO_PAD.encode(b"unsigned");
    format!("{header}.{body}.{signature}")
}

fn login_payload(username: &str, server_address: &str) -> Vec<u8> {
    let identity = fake_jwt(&serde_json::json!({
        "extraData": { "displayName": username }
    }));
    let chain_json = serde_json::json!({ "chain": [identity] }).to_string();
    let client_jwt = fake_jwt(&serde_json::json!({ "ServerAddress": server_address }));

    let mut login_body = BytesMut::new();
    login_body.put_i32(712);
    let mut request = BytesMut::new();
    request.put_u32_le(chain_json.len() as u32);
    request.put_slice(chain_json.as_bytes());
    request.put_u32_le(client_jwt.len() as u32);
    request.put_slice(client_jwt.as_bytes());
    write_varuint(&mut login_body, request.len() as u32);
    login_body.put_slice(&request);

    let mut packet = BytesMut::new();
    write_varuint(&mut packet, 0x01); // login id
    packet.put_slice(&login_body);

    let mut out = BytesMut::new();
    out.put_u8(ID_GAME_PACKET);
    write_varuint(&mut out, packet.len() as u32);
    out.put_slice(&packet);
    out.to_vec()
}

/// A RakNet upstream that records the first payload of each session
/// and answers with a canned game packet.
async fn spawn_raknet_upstream() -> (std::net::SocketAddr, mpsc::UnboundedReceiver<Vec<u8>>) {
    let mut listener = RaknetListener::bind("127.0.0.1:0".parse().unwrap(), "upstream".into(), 99)
        .await
        .unwrap();
    let addr = listener.local_addr();
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(mut session) = listener.accept().await {
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; 64 * 1024];
                let n = session.stream.read(&mut buf).await.unwrap_or(0);
                let _ = tx.send(buf[..n].to_vec());
                let _ = session
                    .stream
                    .write_all(&[ID_GAME_PACKET, 0xaa, 0xbb])
                    .await;
                // Hold the session open until the peer goes away.
                let mut sink = vec![0u8; 4096];
                while session.stream.read(&mut sink).await.unwrap_or(0) > 0 {}
            });
        }
    });
    (addr, rx)
}

#[tokio::test]
async fn bedrock_login_routes_and_replays_prelude() {
    let (upstream_addr, mut received) = spawn_raknet_upstream().await;
    let yaml = format!(
        r#"
bedrock:
  listeners:
    - id: main
      bind: 127.0.0.1:0
      motd: proxy
  servers:
    - id: lobby
      domains: ["*"]
      addresses: ["{upstream_addr}"]
"#
    );
    let config = craft_router::config::load_config_str(&yaml).unwrap();
    let set = std::sync::Arc::new(craft_router::proxy::ProxySet::new(EventBus::new()));
    set.apply_config(&config).await.unwrap();
    let proxy_addr = set.get(Edition::Bedrock).listener_addrs()[0];

    let mut client = session::connect(proxy_addr, Duration::from_secs(5))
        .await
        .unwrap();

    let login = login_payload("Steve", "play.example.com");
    client.write_all(&login).await.unwrap();

    // The upstream session received the login payload verbatim.
    let upstream_bytes = tokio::time::timeout(Duration::from_secs(5), received.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(upstream_bytes, login);

    // And the upstream's reply reaches the client through the pump.
    let mut reply = [0u8; 3];
    tokio::time::timeout(Duration::from_secs(5), client.read_exact(&mut reply))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply, [ID_GAME_PACKET, 0xaa, 0xbb]);
}

#[tokio::test]
async fn bedrock_username_reaches_events() {
    let (upstream_addr, _received) = spawn_raknet_upstream().await;
    let yaml = format!(
        r#"
bedrock:
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
    let mut events = bus.subscribe_async("observer");
    let config = craft_router::config::load_config_str(&yaml).unwrap();
    let set = std::sync::Arc::new(craft_router::proxy::ProxySet::new(bus));
    set.apply_config(&config).await.unwrap();
    let proxy_addr = set.get(Edition::Bedrock).listener_addrs()[0];

    let mut client = session::connect(proxy_addr, Duration::from_secs(5))
        .await
        .unwrap();
    client
        .write_all(&login_payload("Steve", "play.example.com"))
        .await
        .unwrap();

    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("an event")
            .expect("bus alive");
        if let craft_router::event::Event::PreLogin { conn } = event {
            assert_eq!(conn.edition, Edition::Bedrock);
            assert_eq!(conn.username.as_deref(), Some("Steve"));
            assert_eq!(conn.requested_host, "play.example.com");
            return;
        }
    }
}

#[tokio::test]
async fn bedrock_disconnect_route_sends_game_disconnect() {
    let yaml = r#"
bedrock:
  listeners:
    - id: main
      bind: 127.0.0.1:0
  servers:
    - id: reject
      domains: ["*"]
      on_match_action: disconnect
      disconnect_message: maintenance
"#;
    let bus = EventBus::new();
    let config = craft_router::config::load_config_str(yaml).unwrap();
    let set = std::sync::Arc::new(craft_router::proxy::ProxySet::new(bus));
    set.apply_config(&config).await.unwrap();
    let proxy_addr = set.get(Edition::Bedrock).listener_addrs()[0];

    let mut client = session::connect(proxy_addr, Duration::from_secs(5))
        .await
        .unwrap();
    client
        .write_all(&login_payload("Steve", "play.example.com"))
        .await
        .unwrap();

    let mut buf = vec![0u8; 4096];
    let n = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert!(n > 0);
    assert_eq!(buf[0], ID_GAME_PACKET);
    assert!(String::from_utf8_lossy(&buf[..n]).contains("maintenance"));
}
