//! Upstream dialing and canned responses
//!
//! On a `Forward` match the dialer tries the route's addresses in
//! order, each under the route's dial timeout, optionally prepends a
//! PROXY v2 header, and replays the prelude. `Status` and `Disconnect`
//! matches (and no-match fallbacks) are answered locally with the
//! edition's canned packets.

use std::net::SocketAddr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::io::AsyncWriteExt;
use tokio::net::{lookup_host, TcpStream};
use tracing::{debug, warn};

use super::conn::{EditionStream, ProcessedConn};
use crate::bedrock;
use crate::error::ConnectionError;
use crate::java::codec::{read_packet, write_packet};
use crate::java::packets::{
    pong_for, LoginDisconnect, NextState, StatusJson, PING_PACKET_ID, STATUS_REQUEST_PACKET_ID,
};
use crate::proxy_protocol;
use crate::routing::ServerRoute;
use crate::Edition;

/// How long the local status exchange may take in total.
const STATUS_EXCHANGE_TIMEOUT: Duration = Duration::from_secs(10);

/// Dial the route's upstream addresses in order.
///
/// Each address gets the route's dial timeout; the first success wins.
///
/// # Errors
///
/// `DialFailed` once every address has been tried.
pub async fn dial_route(
    route: &ServerRoute,
    edition: Edition,
) -> Result<(EditionStream, SocketAddr), ConnectionError> {
    let mut last_error = String::from("no addresses configured");
    for address in &route.addresses {
        match dial_address(address, edition, route.dial_timeout).await {
            Ok(ok) => return Ok(ok),
            Err(e) => {
                debug!(route = %route.id, address = %address, error = %e, "upstream dial failed");
                last_error = format!("{address}: {e}");
            }
        }
    }
    Err(ConnectionError::DialFailed {
        route_id: route.id.clone(),
        reason: last_error,
    })
}

async fn dial_address(
    address: &str,
    edition: Edition,
    dial_timeout: Duration,
) -> Result<(EditionStream, SocketAddr), ConnectionError> {
    let resolved = lookup_host(address)
        .await?
        .next()
        .ok_or_else(|| {
            ConnectionError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "address resolved to nothing",
            ))
        })?;

    match edition {
        Edition::Java => {
            let stream = tokio::time::timeout(dial_timeout, TcpStream::connect(resolved))
                .await
                .map_err(|_| {
                    ConnectionError::Io(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "connect timed out",
                    ))
                })??;
            Ok((EditionStream::Tcp(stream), resolved))
        }
        Edition::Bedrock => {
            let stream = bedrock::session::connect(resolved, dial_timeout).await?;
            Ok((EditionStream::Raknet(stream), resolved))
        }
    }
}

/// Write the PROXY header (when configured) and the prelude to a
/// freshly dialed upstream.
///
/// # Errors
///
/// Propagates transport errors.
pub async fn replay_prelude(
    upstream: &mut EditionStream,
    upstream_addr: SocketAddr,
    route: &ServerRoute,
    conn: &ProcessedConn,
) -> Result<(), ConnectionError> {
    if route.send_proxy_protocol {
        let header = proxy_protocol::encode_v2(
            conn.remote_addr,
            upstream_addr,
            conn.edition == Edition::Bedrock,
        );
        upstream.write_all(&header).await?;
    }
    upstream.write_all(&build_prelude(route, conn)).await?;
    upstream.flush().await?;
    Ok(())
}

/// The prelude to replay: the consumed bytes verbatim, unless the
/// route rewrites the Java handshake to carry the real client IP.
#[must_use]
pub fn build_prelude(route: &ServerRoute, conn: &ProcessedConn) -> Vec<u8> {
    if route.real_ip_header && conn.edition == Edition::Java {
        if let Some(handshake) = &conn.handshake {
            let mut rewritten = handshake.clone();
            let timestamp = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0);
            rewritten.server_address = format!(
                "{}///{}///{}",
                handshake.server_address, conn.remote_addr, timestamp
            );
            let mut prelude = rewritten.marshal().encode();
            if let Some(raw) = &conn.login_raw {
                prelude.extend_from_slice(raw);
            }
            return prelude;
        }
    }
    conn.prelude.clone()
}

/// Serve a canned status locally and close.
///
/// Java status-state clients get the full request/response/ping
/// exchange; Java login-state clients get a login disconnect carrying
/// `message`; Bedrock clients get the edition disconnect.
pub async fn serve_status(conn: &mut ProcessedConn, status: &StatusJson, message: &str) {
    match (conn.edition, conn.next_state) {
        (Edition::Java, NextState::Status) => {
            match tokio::time::timeout(
                STATUS_EXCHANGE_TIMEOUT,
                java_status_exchange(&mut conn.stream, status),
            )
            .await
            {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(error = %e, "status exchange failed"),
                Err(_) => debug!("status exchange timed out"),
            }
        }
        _ => send_disconnect(conn, message).await,
    }
}

async fn java_status_exchange(
    stream: &mut EditionStream,
    status: &StatusJson,
) -> Result<(), ConnectionError> {
    // Request -> response, then an optional ping echo.
    for _ in 0..2 {
        let (packet, _) = match read_packet(stream).await {
            Ok(v) => v,
            // Client went away; a status probe closing early is normal.
            Err(_) => return Ok(()),
        };
        match packet.id {
            STATUS_REQUEST_PACKET_ID => {
                write_packet(stream, &status.to_packet()).await?;
            }
            PING_PACKET_ID => {
                write_packet(stream, &pong_for(&packet)).await?;
                return Ok(());
            }
            other => {
                debug!(id = other, "unexpected packet during status exchange");
                return Ok(());
            }
        }
    }
    Ok(())
}

/// Send the edition-appropriate disconnect and leave the connection to
/// be closed by the caller.
pub async fn send_disconnect(conn: &mut ProcessedConn, message: &str) {
    let result = match conn.edition {
        Edition::Java => {
            if conn.next_state == NextState::Login {
                write_packet(&mut conn.stream, &LoginDisconnect::with_text(message).marshal())
                    .await
                    .map_err(ConnectionError::from)
            } else {
                // A status-state client gets the message as the MOTD.
                let status = StatusJson {
                    description: serde_json::json!({ "text": message }),
                    ..StatusJson::default()
                };
                java_status_exchange(&mut conn.stream, &status).await
            }
        }
        Edition::Bedrock => conn
            .stream
            .write_all(&bedrock::login::encode_disconnect(message))
            .await
            .map_err(ConnectionError::from),
    };
    if let Err(e) = result {
        warn!(error = %e, "failed to deliver disconnect");
    }
}
