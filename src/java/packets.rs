//! Typed Java edition handshake and login packets
//!
//! Only the packets the proxy must understand are modelled here; all
//! traffic after login is opaque. Packet layouts:
//!
//! ```text
//! Handshake (serverbound, state=handshaking, id 0x00)
//!   ProtocolVersion (VarInt)
//!   ServerAddress (String <= 255)
//!   ServerPort (Unsigned Short, big-endian)
//!   NextState (VarInt: 1 = status, 2 = login)
//!
//! LoginStart (serverbound, state=login, id 0x00)
//!   Username (String <= 16)
//!   ... trailing fields vary by protocol version and are kept opaque
//!
//! StatusRequest (serverbound, state=status, id 0x00)  -- empty
//! StatusResponse (clientbound, state=status, id 0x00) -- JSON String
//! PingRequest (serverbound, state=status, id 0x01)    -- i64, echoed
//! LoginDisconnect (clientbound, state=login, id 0x00) -- chat JSON String
//! ```

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use super::codec::{
    read_string, read_varint, write_string, write_varint, Packet, MAX_SERVER_ADDRESS_LEN,
};
use crate::error::ProtocolError;

pub const HANDSHAKE_PACKET_ID: i32 = 0x00;
pub const LOGIN_START_PACKET_ID: i32 = 0x00;
pub const STATUS_REQUEST_PACKET_ID: i32 = 0x00;
pub const STATUS_RESPONSE_PACKET_ID: i32 = 0x00;
pub const PING_PACKET_ID: i32 = 0x01;
pub const LOGIN_DISCONNECT_PACKET_ID: i32 = 0x00;

/// The client's declared intent after the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextState {
    Status,
    Login,
}

impl NextState {
    /// Parse the handshake `NextState` field.
    ///
    /// # Errors
    ///
    /// `Malformed` for any value other than 1 or 2.
    pub fn from_varint(v: i32) -> Result<Self, ProtocolError> {
        match v {
            1 => Ok(Self::Status),
            2 => Ok(Self::Login),
            other => Err(ProtocolError::malformed(format!(
                "invalid next state {other}"
            ))),
        }
    }

    #[must_use]
    pub fn as_varint(self) -> i32 {
        match self {
            Self::Status => 1,
            Self::Login => 2,
        }
    }
}

/// The initial serverbound handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub protocol_version: i32,
    pub server_address: String,
    pub server_port: u16,
    pub next_state: NextState,
}

impl Handshake {
    /// Unmarshal a handshake from a framed packet.
    ///
    /// # Errors
    ///
    /// `Unexpected` if the packet ID is not 0x00, `Malformed` on field
    /// violations.
    pub fn unmarshal(packet: &Packet) -> Result<Self, ProtocolError> {
        if packet.id != HANDSHAKE_PACKET_ID {
            return Err(ProtocolError::Unexpected {
                id: packet.id,
                expected: "handshake (0x00)",
            });
        }
        let mut buf = packet.payload.clone();
        let protocol_version = read_varint(&mut buf)?;
        let server_address = read_string(&mut buf, MAX_SERVER_ADDRESS_LEN)?;
        if buf.len() < 2 {
            return Err(ProtocolError::ShortRead { context: "server port" });
        }
        let server_port = u16::from_be_bytes([buf[0], buf[1]]);
        bytes::Buf::advance(&mut buf, 2);
        let next_state = NextState::from_varint(read_varint(&mut buf)?)?;
        Ok(Self {
            protocol_version,
            server_address,
            server_port,
            next_state,
        })
    }

    /// Marshal this handshake into a framed packet.
    #[must_use]
    pub fn marshal(&self) -> Packet {
        let mut buf = BytesMut::new();
        write_varint(&mut buf, self.protocol_version);
        write_string(&mut buf, &self.server_address);
        buf.extend_from_slice(&self.server_port.to_be_bytes());
        write_varint(&mut buf, self.next_state.as_varint());
        Packet::new(HANDSHAKE_PACKET_ID, buf.freeze())
    }

    /// The requested host with transport noise removed: anything after a
    /// NUL separator (Forge/FML markers), surrounding whitespace, and
    /// trailing dots are stripped, and the result is lowercased.
    #[must_use]
    pub fn sanitized_address(&self) -> String {
        crate::routing::sanitize_host(&self.server_address)
    }
}

/// The first packet of the login state, carrying the username.
///
/// Trailing fields (signature data, profile UUID) shifted across
/// protocol versions; they are preserved opaquely via the raw frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginStart {
    pub username: String,
}

impl LoginStart {
    /// Unmarshal a login start from a framed packet.
    ///
    /// # Errors
    ///
    /// `Unexpected` on a foreign packet ID, `Malformed` on an invalid
    /// username field.
    pub fn unmarshal(packet: &Packet) -> Result<Self, ProtocolError> {
        if packet.id != LOGIN_START_PACKET_ID {
            return Err(ProtocolError::Unexpected {
                id: packet.id,
                expected: "login start (0x00)",
            });
        }
        let mut buf = packet.payload.clone();
        let username = read_string(&mut buf, 16)?;
        Ok(Self { username })
    }

    /// Marshal a minimal login start (username only).
    #[must_use]
    pub fn marshal(&self) -> Packet {
        let mut buf = BytesMut::new();
        write_string(&mut buf, &self.username);
        Packet::new(LOGIN_START_PACKET_ID, buf.freeze())
    }
}

/// Clientbound status response carrying the server-list JSON document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusResponse {
    pub json: String,
}

impl StatusResponse {
    #[must_use]
    pub fn marshal(&self) -> Packet {
        let mut buf = BytesMut::new();
        write_string(&mut buf, &self.json);
        Packet::new(STATUS_RESPONSE_PACKET_ID, buf.freeze())
    }

    /// Unmarshal a status response.
    ///
    /// # Errors
    ///
    /// `Unexpected` on a foreign packet ID, `Malformed` on a bad string.
    pub fn unmarshal(packet: &Packet) -> Result<Self, ProtocolError> {
        if packet.id != STATUS_RESPONSE_PACKET_ID {
            return Err(ProtocolError::Unexpected {
                id: packet.id,
                expected: "status response (0x00)",
            });
        }
        let mut buf = packet.payload.clone();
        let json = read_string(&mut buf, 1 << 16)?;
        Ok(Self { json })
    }
}

/// Clientbound login-state disconnect with a chat-JSON reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginDisconnect {
    pub reason: String,
}

impl LoginDisconnect {
    /// Wrap a plain-text message as chat JSON.
    #[must_use]
    pub fn with_text(message: &str) -> Self {
        let reason = serde_json::json!({ "text": message }).to_string();
        Self { reason }
    }

    #[must_use]
    pub fn marshal(&self) -> Packet {
        let mut buf = BytesMut::new();
        write_string(&mut buf, &self.reason);
        Packet::new(LOGIN_DISCONNECT_PACKET_ID, buf.freeze())
    }
}

/// Build the echo reply for a status-state ping.
#[must_use]
pub fn pong_for(ping: &Packet) -> Packet {
    Packet::new(PING_PACKET_ID, ping.payload.clone())
}

// ============================================================================
// Status response JSON document
// ============================================================================

/// The server-list status document, serialized into [`StatusResponse`].
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StatusJson {
    pub version: StatusVersionJson,
    pub players: StatusPlayersJson,
    pub description: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub favicon: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StatusVersionJson {
    pub name: String,
    pub protocol: i32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StatusPlayersJson {
    pub max: i32,
    pub online: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample: Option<Vec<StatusPlayerSampleJson>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StatusPlayerSampleJson {
    pub name: String,
    pub id: String,
}

impl StatusJson {
    /// Render this document as a clientbound status response packet.
    #[must_use]
    pub fn to_packet(&self) -> Packet {
        let json = serde_json::to_string(self).unwrap_or_else(|_| "{}".into());
        StatusResponse { json }.marshal()
    }
}
