//! Bedrock connection processor
//!
//! Turns a freshly opened RakNet session into a
//! [`ProcessedConn`](crate::proxy::ProcessedConn): the first
//! application payload must be the login game packet, whose JWT chain
//! names the player and the requested server address. The raw payload
//! is kept as the prelude for replay to the upstream session.

use std::net::SocketAddr;

use tokio::io::AsyncReadExt;
use tracing::debug;

use super::login::parse_login;
use super::session::NewSession;
use crate::config::ListenerBinding;
use crate::error::{ConnectionError, ProtocolError};
use crate::java::packets::NextState;
use crate::proxy::{EditionStream, ProcessedConn};
use crate::proxy_protocol;
use crate::routing::sanitize_host;
use crate::Edition;

/// Largest accepted login payload after reassembly.
const MAX_LOGIN_PAYLOAD: usize = 1 << 20;

/// Process the opening payload of a Bedrock session.
///
/// # Errors
///
/// `HandshakeTimeout` when the login does not arrive within the
/// listener deadline; protocol errors when it is not a valid login.
pub async fn process(
    session: NewSession,
    local_addr: SocketAddr,
    listener: &ListenerBinding,
) -> Result<ProcessedConn, ConnectionError> {
    let NewSession { mut stream, peer } = session;
    let mut remote_addr = peer;

    if listener.trusts_proxy_peer(peer.ip()) {
        if let Some(header) = proxy_protocol::read_header(&mut stream).await? {
            debug!(peer = %peer, source = %header.source, "adopted PROXY protocol source");
            remote_addr = header.source;
        }
    }

    let timeout_ms = listener.client_timeout.as_millis() as u64;
    let prelude = tokio::time::timeout(listener.client_timeout, read_first_payload(&mut stream))
        .await
        .map_err(|_| ConnectionError::HandshakeTimeout { timeout_ms })??;

    let info = parse_login(&prelude)?;
    let requested_host = sanitize_host(&info.server_address);
    let requested_port = info.server_port.unwrap_or(local_addr.port());

    Ok(ProcessedConn {
        stream: EditionStream::Raknet(stream),
        edition: Edition::Bedrock,
        remote_addr,
        local_addr,
        gate_id: listener.gate_id.clone(),
        requested_host,
        requested_port,
        username: Some(info.username),
        protocol_version: info.protocol_version,
        next_state: NextState::Login,
        handshake: None,
        login_raw: None,
        prelude,
    })
}

/// Read exactly one application payload off the session stream.
async fn read_first_payload(
    stream: &mut super::session::RaknetStream,
) -> Result<Vec<u8>, ConnectionError> {
    // One session read yields one reassembled payload; the buffer only
    // bounds its size.
    let mut buf = vec![0u8; MAX_LOGIN_PAYLOAD];
    let n = stream.read(&mut buf).await?;
    if n == 0 {
        return Err(ProtocolError::ShortRead {
            context: "login payload",
        }
        .into());
    }
    buf.truncate(n);
    Ok(buf)
}
