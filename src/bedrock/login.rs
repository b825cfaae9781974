//! Bedrock login packet parsing
//!
//! The first application payload of a session is a game wrapper
//! (`0xfe`) batch containing the `Login` packet:
//!
//! ```text
//! 0xfe
//! Batch (repeated):
//!   Length (VarUInt32)
//!   Header (VarUInt32)   packet id in the low 10 bits
//!   Body
//!
//! Login body:
//!   ProtocolVersion (i32, BE)
//!   Payload length (VarUInt32)
//!   ChainJson length (u32, LE) || ChainJson
//!   ClientJwt length (u32, LE) || ClientJwt
//! ```
//!
//! `ChainJson` is `{"chain": [<jwt>, ...]}`; the final claim's
//! `extraData.displayName` names the player. The client JWT's claims
//! carry `ServerAddress`, the host the player typed. Only structure is
//! verified here: signatures are never validated, the proxy is
//! agnostic to Bedrock account auth.

use base64::engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::Deserialize;

use super::raknet::ID_GAME_PACKET;
use crate::error::ProtocolError;

/// Bedrock `Login` packet id.
pub const LOGIN_PACKET_ID: u32 = 0x01;

/// Bedrock `Disconnect` packet id.
pub const DISCONNECT_PACKET_ID: u32 = 0x05;

/// Identity and routing intent extracted from a Bedrock login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginInfo {
    pub username: String,
    /// The address the client typed, `:port` suffix already split off.
    pub server_address: String,
    pub server_port: Option<u16>,
    pub protocol_version: i32,
}

#[derive(Debug, Deserialize)]
struct ChainJson {
    chain: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ChainClaims {
    #[serde(rename = "extraData")]
    extra_data: Option<ExtraData>,
}

#[derive(Debug, Deserialize)]
struct ExtraData {
    #[serde(rename = "displayName")]
    display_name: String,
}

#[derive(Debug, Deserialize)]
struct ClientClaims {
    #[serde(rename = "ServerAddress")]
    server_address: Option<String>,
}

/// Parse the first application payload of a session as a `Login`.
///
/// # Errors
///
/// `Unexpected` when the payload is not a game wrapper or the first
/// batched packet is not a login; `Malformed` on structural damage.
pub fn parse_login(payload: &[u8]) -> Result<LoginInfo, ProtocolError> {
    let mut buf = payload;
    if buf.first() != Some(&ID_GAME_PACKET) {
        return Err(ProtocolError::Unexpected {
            id: buf.first().map_or(-1, |b| i32::from(*b)),
            expected: "game packet wrapper (0xfe)",
        });
    }
    buf.advance(1);

    // First batched packet must be the login.
    let packet_len = read_varuint(&mut buf)? as usize;
    if buf.remaining() < packet_len {
        return Err(ProtocolError::ShortRead { context: "batched packet" });
    }
    let mut packet = &buf[..packet_len];
    let header = read_varuint(&mut packet)?;
    let packet_id = header & 0x3ff;
    if packet_id != LOGIN_PACKET_ID {
        return Err(ProtocolError::Unexpected {
            id: packet_id as i32,
            expected: "login (0x01)",
        });
    }

    if packet.remaining() < 4 {
        return Err(ProtocolError::ShortRead { context: "login protocol" });
    }
    let protocol_version = packet.get_i32();
    let _payload_len = read_varuint(&mut packet)?;

    let chain_json = read_le_chunk(&mut packet, "chain json")?;
    let client_jwt = read_le_chunk(&mut packet, "client jwt")?;

    let chain: ChainJson = serde_json::from_slice(&chain_json)
        .map_err(|e| ProtocolError::malformed(format!("chain json: {e}")))?;
    if chain.chain.is_empty() {
        return Err(ProtocolError::malformed("empty login chain"));
    }

    // The display name lives in the last chain claim that carries
    // identity data.
    let mut username = None;
    for jwt in chain.chain.iter().rev() {
        let claims: ChainClaims = decode_jwt_claims(jwt)?;
        if let Some(extra) = claims.extra_data {
            username = Some(extra.display_name);
            break;
        }
    }
    let username =
        username.ok_or_else(|| ProtocolError::malformed("login chain has no identity claim"))?;

    let client_claims: ClientClaims = decode_jwt_claims(
        std::str::from_utf8(&client_jwt)
            .map_err(|_| ProtocolError::malformed("client jwt is not UTF-8"))?,
    )?;
    let raw_address = client_claims
        .server_address
        .ok_or_else(|| ProtocolError::malformed("client claims have no ServerAddress"))?;

    let (server_address, server_port) = split_address_port(&raw_address);

    Ok(LoginInfo {
        username,
        server_address,
        server_port,
        protocol_version,
    })
}

/// Split a trailing `:port` off a Bedrock server address, handling
/// bracketed IPv6 literals.
fn split_address_port(raw: &str) -> (String, Option<u16>) {
    if let Some(stripped) = raw.strip_prefix('[') {
        // [v6]:port
        if let Some((host, rest)) = stripped.split_once(']') {
            let port = rest.strip_prefix(':').and_then(|p| p.parse().ok());
            return (host.to_string(), port);
        }
        return (raw.to_string(), None);
    }
    match raw.rsplit_once(':') {
        // A second colon means a bare IPv6 literal, not host:port.
        Some((host, port)) if !host.contains(':') => {
            (host.to_string(), port.parse().ok())
        }
        _ => (raw.to_string(), None),
    }
}

fn read_le_chunk(buf: &mut &[u8], context: &'static str) -> Result<Bytes, ProtocolError> {
    if buf.remaining() < 4 {
        return Err(ProtocolError::ShortRead { context });
    }
    let len = buf.get_u32_le() as usize;
    if buf.remaining() < len {
        return Err(ProtocolError::ShortRead { context });
    }
    let chunk = Bytes::copy_from_slice(&buf[..len]);
    buf.advance(len);
    Ok(chunk)
}

/// Decode the claims section of a JWT without validating anything else.
fn decode_jwt_claims<T: serde::de::DeserializeOwned>(jwt: &str) -> Result<T, ProtocolError> {
    let mut parts = jwt.split('.');
    let (_header, claims) = match (parts.next(), parts.next()) {
        (Some(h), Some(c)) => (h, c),
        _ => return Err(ProtocolError::malformed("jwt has fewer than two sections")),
    };
    let decoded = URL_SAFE_NO_PAD
        .decode(claims)
        .or_else(|_| URL_SAFE.decode(claims))
        .map_err(|_| ProtocolError::malformed("jwt claims are not base64"))?;
    serde_json::from_slice(&decoded)
        .map_err(|e| ProtocolError::malformed(format!("jwt claims: {e}")))
}

/// Encode a Bedrock disconnect as a game wrapper payload.
#[must_use]
pub fn encode_disconnect(message: &str) -> Vec<u8> {
    let mut body = BytesMut::new();
    write_varuint(&mut body, DISCONNECT_PACKET_ID);
    body.put_u8(0); // do not hide the disconnect screen
    write_varuint(&mut body, message.len() as u32);
    body.put_slice(message.as_bytes());

    let mut out = BytesMut::with_capacity(body.len() + 8);
    out.put_u8(ID_GAME_PACKET);
    write_varuint(&mut out, body.len() as u32);
    out.put_slice(&body);
    out.to_vec()
}

fn read_varuint(buf: &mut &[u8]) -> Result<u32, ProtocolError> {
    let mut value: u32 = 0;
    let mut shift: u32 = 0;
    loop {
        if !buf.has_remaining() {
            return Err(ProtocolError::ShortRead { context: "varuint" });
        }
        let b = buf.get_u8();
        value |= u32::from(b & 0x7f) << shift;
        if b & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
        if shift >= 35 {
            return Err(ProtocolError::malformed("varuint longer than 5 bytes"));
        }
    }
}

fn write_varuint(buf: &mut BytesMut, mut value: u32) {
    loop {
        let b = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buf.put_u8(b);
            return;
        }
        buf.put_u8(b | 0x80);
    }
}
