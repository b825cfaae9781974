//! Java connection processor
//!
//! Turns a freshly accepted TCP connection into a
//! [`ProcessedConn`](crate::proxy::ProcessedConn): consumes a PROXY
//! header from trusted peers, reads the handshake (and the login start
//! when the client intends to log in), and accumulates every consumed
//! byte as the prelude for upstream replay.

use std::net::SocketAddr;

use tokio::net::TcpStream;
use tracing::debug;

use super::codec::read_packet;
use super::packets::{Handshake, LoginStart, NextState};
use crate::config::ListenerBinding;
use crate::error::ConnectionError;
use crate::proxy::{EditionStream, ProcessedConn};
use crate::proxy_protocol;
use crate::Edition;

/// Process the opening bytes of a Java connection.
///
/// # Errors
///
/// `ProxyProtocol` when a trusted peer sends a bad header (fatal for
/// the connection), `HandshakeTimeout` when the client stalls past the
/// listener deadline, and protocol errors for malformed handshakes.
pub async fn process(
    mut stream: TcpStream,
    peer: SocketAddr,
    listener: &ListenerBinding,
) -> Result<ProcessedConn, ConnectionError> {
    let local_addr = stream.local_addr()?;
    let mut remote_addr = peer;

    // A trusted peer that promises PROXY protocol must deliver it; an
    // untrusted peer's bytes are left untouched for the handshake read.
    if listener.trusts_proxy_peer(peer.ip()) {
        if let Some(header) = proxy_protocol::read_header(&mut stream).await? {
            debug!(peer = %peer, source = %header.source, "adopted PROXY protocol source");
            remote_addr = header.source;
        }
    }

    let timeout_ms = listener.client_timeout.as_millis() as u64;
    let (handshake, login, prelude) =
        tokio::time::timeout(listener.client_timeout, read_opening(&mut stream))
            .await
            .map_err(|_| ConnectionError::HandshakeTimeout { timeout_ms })??;

    let requested_host = handshake.sanitized_address();
    let login_raw = login.as_ref().map(|(_, raw)| raw.clone());
    let username = login.map(|(start, _)| start.username);

    Ok(ProcessedConn {
        stream: EditionStream::Tcp(stream),
        edition: Edition::Java,
        remote_addr,
        local_addr,
        gate_id: listener.gate_id.clone(),
        requested_host,
        requested_port: handshake.server_port,
        username,
        protocol_version: handshake.protocol_version,
        next_state: handshake.next_state,
        handshake: Some(handshake),
        login_raw,
        prelude,
    })
}

async fn read_opening(
    stream: &mut TcpStream,
) -> Result<(Handshake, Option<(LoginStart, Vec<u8>)>, Vec<u8>), ConnectionError> {
    let (packet, mut prelude) = read_packet(stream).await?;
    let handshake = Handshake::unmarshal(&packet)?;

    let login = if handshake.next_state == NextState::Login {
        let (packet, raw) = read_packet(stream).await?;
        let start = LoginStart::unmarshal(&packet)?;
        prelude.extend_from_slice(&raw);
        Some((start, raw))
    } else {
        None
    };

    Ok((handshake, login, prelude))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::java::codec::Packet;
    use bytes::Bytes;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    fn listener_binding(client_timeout: Duration) -> ListenerBinding {
        ListenerBinding {
            id: "test".into(),
            bind: "127.0.0.1:0".parse().unwrap(),
            gate_id: "default".into(),
            receive_proxy_protocol: false,
            trusted_proxy_cidrs: Vec::new(),
            client_timeout,
            motd: "test".into(),
        }
    }

    async fn accept_pair() -> (TcpStream, TcpStream, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, peer) = listener.accept().await.unwrap();
        (client, server, peer)
    }

    #[tokio::test]
    async fn status_handshake_produces_processed_conn() {
        let (mut client, server, peer) = accept_pair().await;
        let handshake = Handshake {
            protocol_version: 765,
            server_address: "Play.Example.COM".into(),
            server_port: 25565,
            next_state: NextState::Status,
        };
        let frame = handshake.marshal().encode();
        client.write_all(&frame).await.unwrap();

        let binding = listener_binding(Duration::from_secs(5));
        let conn = process(server, peer, &binding).await.unwrap();
        assert_eq!(conn.requested_host, "play.example.com");
        assert_eq!(conn.requested_port, 25565);
        assert_eq!(conn.next_state, NextState::Status);
        assert_eq!(conn.username, None);
        assert_eq!(conn.prelude, frame);
    }

    #[tokio::test]
    async fn login_handshake_captures_username_and_prelude() {
        let (mut client, server, peer) = accept_pair().await;
        let handshake = Handshake {
            protocol_version: 765,
            server_address: "play.example.com".into(),
            server_port: 25565,
            next_state: NextState::Login,
        };
        let login = LoginStart {
            username: "Alice".into(),
        };
        let mut sent = handshake.marshal().encode();
        sent.extend_from_slice(&login.marshal().encode());
        client.write_all(&sent).await.unwrap();

        let binding = listener_binding(Duration::from_secs(5));
        let conn = process(server, peer, &binding).await.unwrap();
        assert_eq!(conn.username.as_deref(), Some("Alice"));
        assert_eq!(conn.prelude, sent);
        assert_eq!(conn.next_state, NextState::Login);
    }

    #[tokio::test]
    async fn slow_client_times_out() {
        let (_client, server, peer) = accept_pair().await;
        let binding = listener_binding(Duration::from_millis(50));
        let err = process(server, peer, &binding).await.unwrap_err();
        assert!(matches!(err, ConnectionError::HandshakeTimeout { .. }));
    }

    #[tokio::test]
    async fn garbage_handshake_is_rejected() {
        let (mut client, server, peer) = accept_pair().await;
        // A framed packet with a non-handshake id.
        let packet = Packet::new(0x7f, Bytes::from_static(b"junk"));
        client.write_all(&packet.encode()).await.unwrap();

        let binding = listener_binding(Duration::from_secs(5));
        assert!(process(server, peer, &binding).await.is_err());
    }
}
