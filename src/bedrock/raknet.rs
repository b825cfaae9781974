//! RakNet wire codec
//!
//! The Bedrock edition rides on RakNet over UDP. This module is the
//! pure codec: offline (unconnected) packets, connected datagrams with
//! their encapsulated frames, and ACK/NAK records. It performs no I/O;
//! sessions in [`super::session`] drive it.
//!
//! Datagram layout (connected):
//!
//! ```text
//! Flags (1 byte)           0x80 valid | 0x40 ACK | 0x20 NAK
//! Sequence (3 bytes, LE)   frame datagrams only
//! Frames (repeated):
//!   Flags (1 byte)         reliability << 5 | 0x10 split
//!   Length in bits (2 bytes, BE)
//!   ReliableIndex (3 LE)   if reliable
//!   SequencedIndex (3 LE)  if sequenced
//!   OrderedIndex (3 LE) +
//!   OrderChannel (1 byte)  if ordered
//!   SplitCount (4 BE) +
//!   SplitID (2 BE) +
//!   SplitIndex (4 BE)      if split
//!   Payload
//! ```
//!
//! Offline packets carry a fixed 16-byte magic. Only the handful the
//! proxy needs are modelled; everything else is passed through or
//! dropped by the session layer.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;

/// Offline message magic, present in every unconnected packet.
pub const OFFLINE_MAGIC: [u8; 16] = [
    0x00, 0xff, 0xff, 0x00, 0xfe, 0xfe, 0xfe, 0xfe, 0xfd, 0xfd, 0xfd, 0xfd, 0x12, 0x34, 0x56,
    0x78,
];

/// RakNet protocol version spoken by current Bedrock clients.
pub const RAKNET_PROTOCOL_VERSION: u8 = 11;

pub const ID_UNCONNECTED_PING: u8 = 0x01;
pub const ID_UNCONNECTED_PING_OPEN: u8 = 0x02;
pub const ID_UNCONNECTED_PONG: u8 = 0x1c;
pub const ID_OPEN_CONNECTION_REQUEST_1: u8 = 0x05;
pub const ID_OPEN_CONNECTION_REPLY_1: u8 = 0x06;
pub const ID_OPEN_CONNECTION_REQUEST_2: u8 = 0x07;
pub const ID_OPEN_CONNECTION_REPLY_2: u8 = 0x08;
pub const ID_INCOMPATIBLE_PROTOCOL_VERSION: u8 = 0x19;

pub const ID_CONNECTED_PING: u8 = 0x00;
pub const ID_CONNECTED_PONG: u8 = 0x03;
pub const ID_CONNECTION_REQUEST: u8 = 0x09;
pub const ID_CONNECTION_REQUEST_ACCEPTED: u8 = 0x10;
pub const ID_NEW_INCOMING_CONNECTION: u8 = 0x13;
pub const ID_DISCONNECT_NOTIFICATION: u8 = 0x15;

/// Wrapper id for Bedrock game packets inside a frame.
pub const ID_GAME_PACKET: u8 = 0xfe;

pub const FLAG_VALID: u8 = 0x80;
pub const FLAG_ACK: u8 = 0x40;
pub const FLAG_NAK: u8 = 0x20;

/// MTU bounds accepted during the open-connection exchange.
pub const MIN_MTU: u16 = 400;
pub const MAX_MTU: u16 = 1500;

/// IP + UDP header overhead assumed by RakNet MTU negotiation.
pub const UDP_OVERHEAD: u16 = 28;

/// Per-frame header budget reserved when splitting payloads.
pub const FRAME_OVERHEAD: u16 = 60;

// ============================================================================
// Primitives
// ============================================================================

fn get_u24_le(buf: &mut impl Buf) -> Result<u32, ProtocolError> {
    if buf.remaining() < 3 {
        return Err(ProtocolError::ShortRead { context: "u24" });
    }
    let a = u32::from(buf.get_u8());
    let b = u32::from(buf.get_u8());
    let c = u32::from(buf.get_u8());
    Ok(a | (b << 8) | (c << 16))
}

fn put_u24_le(buf: &mut BytesMut, v: u32) {
    buf.put_u8((v & 0xff) as u8);
    buf.put_u8(((v >> 8) & 0xff) as u8);
    buf.put_u8(((v >> 16) & 0xff) as u8);
}

/// Decode a RakNet socket address (version-tagged, IPv4 stored
/// ones-complemented).
pub fn get_address(buf: &mut impl Buf) -> Result<SocketAddr, ProtocolError> {
    if !buf.has_remaining() {
        return Err(ProtocolError::ShortRead { context: "address version" });
    }
    match buf.get_u8() {
        4 => {
            if buf.remaining() < 6 {
                return Err(ProtocolError::ShortRead { context: "ipv4 address" });
            }
            let octets = [!buf.get_u8(), !buf.get_u8(), !buf.get_u8(), !buf.get_u8()];
            let port = buf.get_u16();
            Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), port))
        }
        6 => {
            if buf.remaining() < 28 {
                return Err(ProtocolError::ShortRead { context: "ipv6 address" });
            }
            buf.get_u16_le(); // AF_INET6
            let port = buf.get_u16();
            buf.get_u32(); // flow info
            let mut octets = [0u8; 16];
            buf.copy_to_slice(&mut octets);
            buf.get_u32(); // scope id
            Ok(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        v => Err(ProtocolError::malformed(format!(
            "unknown address version {v}"
        ))),
    }
}

/// Encode a RakNet socket address.
pub fn put_address(buf: &mut BytesMut, addr: SocketAddr) {
    match addr.ip() {
        IpAddr::V4(ip) => {
            buf.put_u8(4);
            for o in ip.octets() {
                buf.put_u8(!o);
            }
            buf.put_u16(addr.port());
        }
        IpAddr::V6(ip) => {
            buf.put_u8(6);
            buf.put_u16_le(23); // AF_INET6
            buf.put_u16(addr.port());
            buf.put_u32(0);
            buf.put_slice(&ip.octets());
            buf.put_u32(0);
        }
    }
}

fn check_magic(buf: &mut impl Buf) -> Result<(), ProtocolError> {
    if buf.remaining() < 16 {
        return Err(ProtocolError::ShortRead { context: "offline magic" });
    }
    let mut magic = [0u8; 16];
    buf.copy_to_slice(&mut magic);
    if magic != OFFLINE_MAGIC {
        return Err(ProtocolError::malformed("bad offline magic"));
    }
    Ok(())
}

// ============================================================================
// Offline packets
// ============================================================================

/// Serverbound unconnected ping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnconnectedPing {
    pub send_time: i64,
    pub client_guid: u64,
}

impl UnconnectedPing {
    /// Decode from a datagram body (id byte included).
    ///
    /// # Errors
    ///
    /// `ShortRead`/`Malformed` on truncated or corrupt input.
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        let mut buf = data;
        expect_id(&mut buf, &[ID_UNCONNECTED_PING, ID_UNCONNECTED_PING_OPEN])?;
        if buf.remaining() < 8 {
            return Err(ProtocolError::ShortRead { context: "ping time" });
        }
        let send_time = buf.get_i64();
        check_magic(&mut buf)?;
        if buf.remaining() < 8 {
            return Err(ProtocolError::ShortRead { context: "ping guid" });
        }
        let client_guid = buf.get_u64();
        Ok(Self {
            send_time,
            client_guid,
        })
    }

    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(33);
        buf.put_u8(ID_UNCONNECTED_PING);
        buf.put_i64(self.send_time);
        buf.put_slice(&OFFLINE_MAGIC);
        buf.put_u64(self.client_guid);
        buf.to_vec()
    }
}

/// Clientbound unconnected pong carrying the MOTD string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnconnectedPong {
    pub send_time: i64,
    pub server_guid: u64,
    pub motd: String,
}

impl UnconnectedPong {
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(35 + self.motd.len());
        buf.put_u8(ID_UNCONNECTED_PONG);
        buf.put_i64(self.send_time);
        buf.put_u64(self.server_guid);
        buf.put_slice(&OFFLINE_MAGIC);
        buf.put_u16(self.motd.len() as u16);
        buf.put_slice(self.motd.as_bytes());
        buf.to_vec()
    }

    /// Decode a pong.
    ///
    /// # Errors
    ///
    /// `ShortRead`/`Malformed` on truncated or corrupt input.
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        let mut buf = data;
        expect_id(&mut buf, &[ID_UNCONNECTED_PONG])?;
        if buf.remaining() < 16 {
            return Err(ProtocolError::ShortRead { context: "pong header" });
        }
        let send_time = buf.get_i64();
        let server_guid = buf.get_u64();
        check_magic(&mut buf)?;
        if buf.remaining() < 2 {
            return Err(ProtocolError::ShortRead { context: "motd length" });
        }
        let len = buf.get_u16() as usize;
        if buf.remaining() < len {
            return Err(ProtocolError::ShortRead { context: "motd body" });
        }
        let mut motd = vec![0u8; len];
        buf.copy_to_slice(&mut motd);
        Ok(Self {
            send_time,
            server_guid,
            motd: String::from_utf8_lossy(&motd).into_owned(),
        })
    }
}

/// First open-connection packet; MTU is discovered from the padded size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenConnectionRequest1 {
    pub protocol: u8,
    pub mtu: u16,
}

impl OpenConnectionRequest1 {
    /// Decode; the MTU is the datagram size plus IP/UDP overhead.
    ///
    /// # Errors
    ///
    /// `ShortRead`/`Malformed` on truncated or corrupt input.
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        let total = data.len();
        let mut buf = data;
        expect_id(&mut buf, &[ID_OPEN_CONNECTION_REQUEST_1])?;
        check_magic(&mut buf)?;
        if !buf.has_remaining() {
            return Err(ProtocolError::ShortRead { context: "raknet protocol" });
        }
        let protocol = buf.get_u8();
        let mtu = (total as u16 + UDP_OVERHEAD).clamp(MIN_MTU, MAX_MTU);
        Ok(Self { protocol, mtu })
    }

    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let padded = usize::from(self.mtu.clamp(MIN_MTU, MAX_MTU) - UDP_OVERHEAD);
        let mut buf = BytesMut::with_capacity(padded);
        buf.put_u8(ID_OPEN_CONNECTION_REQUEST_1);
        buf.put_slice(&OFFLINE_MAGIC);
        buf.put_u8(self.protocol);
        buf.resize(padded, 0);
        buf.to_vec()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenConnectionReply1 {
    pub server_guid: u64,
    pub mtu: u16,
}

impl OpenConnectionReply1 {
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(28);
        buf.put_u8(ID_OPEN_CONNECTION_REPLY_1);
        buf.put_slice(&OFFLINE_MAGIC);
        buf.put_u64(self.server_guid);
        buf.put_u8(0); // no cookie / security
        buf.put_u16(self.mtu);
        buf.to_vec()
    }

    /// Decode a reply-1.
    ///
    /// # Errors
    ///
    /// `ShortRead`/`Malformed` on truncated or corrupt input.
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        let mut buf = data;
        expect_id(&mut buf, &[ID_OPEN_CONNECTION_REPLY_1])?;
        check_magic(&mut buf)?;
        if buf.remaining() < 11 {
            return Err(ProtocolError::ShortRead { context: "reply1 body" });
        }
        let server_guid = buf.get_u64();
        let _secure = buf.get_u8();
        let mtu = buf.get_u16();
        Ok(Self { server_guid, mtu })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenConnectionRequest2 {
    pub server_address: SocketAddr,
    pub mtu: u16,
    pub client_guid: u64,
}

impl OpenConnectionRequest2 {
    /// Decode a request-2.
    ///
    /// # Errors
    ///
    /// `ShortRead`/`Malformed` on truncated or corrupt input.
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        let mut buf = data;
        expect_id(&mut buf, &[ID_OPEN_CONNECTION_REQUEST_2])?;
        check_magic(&mut buf)?;
        let server_address = get_address(&mut buf)?;
        if buf.remaining() < 10 {
            return Err(ProtocolError::ShortRead { context: "request2 body" });
        }
        let mtu = buf.get_u16();
        let client_guid = buf.get_u64();
        Ok(Self {
            server_address,
            mtu,
            client_guid,
        })
    }

    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(46);
        buf.put_u8(ID_OPEN_CONNECTION_REQUEST_2);
        buf.put_slice(&OFFLINE_MAGIC);
        put_address(&mut buf, self.server_address);
        buf.put_u16(self.mtu);
        buf.put_u64(self.client_guid);
        buf.to_vec()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenConnectionReply2 {
    pub server_guid: u64,
    pub client_address: SocketAddr,
    pub mtu: u16,
}

impl OpenConnectionReply2 {
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(44);
        buf.put_u8(ID_OPEN_CONNECTION_REPLY_2);
        buf.put_slice(&OFFLINE_MAGIC);
        buf.put_u64(self.server_guid);
        put_address(&mut buf, self.client_address);
        buf.put_u16(self.mtu);
        buf.put_u8(0); // no encryption
        buf.to_vec()
    }

    /// Decode a reply-2.
    ///
    /// # Errors
    ///
    /// `ShortRead`/`Malformed` on truncated or corrupt input.
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        let mut buf = data;
        expect_id(&mut buf, &[ID_OPEN_CONNECTION_REPLY_2])?;
        check_magic(&mut buf)?;
        if buf.remaining() < 8 {
            return Err(ProtocolError::ShortRead { context: "reply2 guid" });
        }
        let server_guid = buf.get_u64();
        let client_address = get_address(&mut buf)?;
        if buf.remaining() < 2 {
            return Err(ProtocolError::ShortRead { context: "reply2 mtu" });
        }
        let mtu = buf.get_u16();
        Ok(Self {
            server_guid,
            client_address,
            mtu,
        })
    }
}

/// Clientbound rejection for unsupported RakNet protocol versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IncompatibleProtocolVersion {
    pub protocol: u8,
    pub server_guid: u64,
}

impl IncompatibleProtocolVersion {
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(26);
        buf.put_u8(ID_INCOMPATIBLE_PROTOCOL_VERSION);
        buf.put_u8(self.protocol);
        buf.put_slice(&OFFLINE_MAGIC);
        buf.put_u64(self.server_guid);
        buf.to_vec()
    }
}

fn expect_id(buf: &mut impl Buf, accepted: &[u8]) -> Result<u8, ProtocolError> {
    if !buf.has_remaining() {
        return Err(ProtocolError::ShortRead { context: "packet id" });
    }
    let id = buf.get_u8();
    if accepted.contains(&id) {
        Ok(id)
    } else {
        Err(ProtocolError::Unexpected {
            id: i32::from(id),
            expected: "raknet offline packet",
        })
    }
}

// ============================================================================
// Connected datagrams and frames
// ============================================================================

/// Frame reliability, two bits of the frame flag byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reliability {
    Unreliable,
    UnreliableSequenced,
    Reliable,
    ReliableOrdered,
    ReliableSequenced,
}

impl Reliability {
    /// Parse the three reliability bits.
    ///
    /// # Errors
    ///
    /// `Malformed` for values outside 0..=4.
    pub fn from_bits(bits: u8) -> Result<Self, ProtocolError> {
        match bits {
            0 => Ok(Self::Unreliable),
            1 => Ok(Self::UnreliableSequenced),
            2 => Ok(Self::Reliable),
            3 => Ok(Self::ReliableOrdered),
            4 => Ok(Self::ReliableSequenced),
            v => Err(ProtocolError::malformed(format!("reliability {v}"))),
        }
    }

    #[must_use]
    pub fn bits(self) -> u8 {
        match self {
            Self::Unreliable => 0,
            Self::UnreliableSequenced => 1,
            Self::Reliable => 2,
            Self::ReliableOrdered => 3,
            Self::ReliableSequenced => 4,
        }
    }

    #[must_use]
    pub fn is_reliable(self) -> bool {
        matches!(
            self,
            Self::Reliable | Self::ReliableOrdered | Self::ReliableSequenced
        )
    }

    #[must_use]
    pub fn is_sequenced(self) -> bool {
        matches!(self, Self::UnreliableSequenced | Self::ReliableSequenced)
    }

    #[must_use]
    pub fn is_ordered(self) -> bool {
        matches!(
            self,
            Self::UnreliableSequenced | Self::ReliableOrdered | Self::ReliableSequenced
        )
    }
}

/// Split (fragmented) frame bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitInfo {
    pub count: u32,
    pub id: u16,
    pub index: u32,
}

/// One encapsulated frame inside a connected datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub reliability: Reliability,
    pub reliable_index: Option<u32>,
    pub sequenced_index: Option<u32>,
    pub ordered: Option<(u32, u8)>,
    pub split: Option<SplitInfo>,
    pub payload: Bytes,
}

impl Frame {
    /// A plain reliable-ordered frame on channel 0.
    #[must_use]
    pub fn reliable_ordered(reliable_index: u32, ordered_index: u32, payload: Bytes) -> Self {
        Self {
            reliability: Reliability::ReliableOrdered,
            reliable_index: Some(reliable_index),
            sequenced_index: None,
            ordered: Some((ordered_index, 0)),
            split: None,
            payload,
        }
    }

    fn encoded_len(&self) -> usize {
        let mut n = 3 + self.payload.len();
        if self.reliability.is_reliable() {
            n += 3;
        }
        if self.reliability.is_sequenced() {
            n += 3;
        }
        if self.reliability.is_ordered() {
            n += 4;
        }
        if self.split.is_some() {
            n += 10;
        }
        n
    }

    fn encode_into(&self, buf: &mut BytesMut) {
        let mut flags = self.reliability.bits() << 5;
        if self.split.is_some() {
            flags |= 0x10;
        }
        buf.put_u8(flags);
        buf.put_u16((self.payload.len() * 8) as u16);
        if self.reliability.is_reliable() {
            put_u24_le(buf, self.reliable_index.unwrap_or(0));
        }
        if self.reliability.is_sequenced() {
            put_u24_le(buf, self.sequenced_index.unwrap_or(0));
        }
        if self.reliability.is_ordered() {
            let (index, channel) = self.ordered.unwrap_or((0, 0));
            put_u24_le(buf, index);
            buf.put_u8(channel);
        }
        if let Some(split) = self.split {
            buf.put_u32(split.count);
            buf.put_u16(split.id);
            buf.put_u32(split.index);
        }
        buf.put_slice(&self.payload);
    }

    fn decode(buf: &mut Bytes) -> Result<Self, ProtocolError> {
        if buf.remaining() < 3 {
            return Err(ProtocolError::ShortRead { context: "frame header" });
        }
        let flags = buf.get_u8();
        let reliability = Reliability::from_bits((flags >> 5) & 0x07)?;
        let is_split = flags & 0x10 != 0;
        let length_bits = buf.get_u16();
        let length = (usize::from(length_bits) + 7) / 8;

        let reliable_index = if reliability.is_reliable() {
            Some(get_u24_le(buf)?)
        } else {
            None
        };
        let sequenced_index = if reliability.is_sequenced() {
            Some(get_u24_le(buf)?)
        } else {
            None
        };
        let ordered = if reliability.is_ordered() {
            let index = get_u24_le(buf)?;
            if !buf.has_remaining() {
                return Err(ProtocolError::ShortRead { context: "order channel" });
            }
            Some((index, buf.get_u8()))
        } else {
            None
        };
        let split = if is_split {
            if buf.remaining() < 10 {
                return Err(ProtocolError::ShortRead { context: "split header" });
            }
            Some(SplitInfo {
                count: buf.get_u32(),
                id: buf.get_u16(),
                index: buf.get_u32(),
            })
        } else {
            None
        };

        if buf.remaining() < length {
            return Err(ProtocolError::ShortRead { context: "frame payload" });
        }
        let payload = buf.split_to(length);
        Ok(Self {
            reliability,
            reliable_index,
            sequenced_index,
            ordered,
            split,
            payload,
        })
    }
}

/// A decoded connected datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Datagram {
    /// Acknowledged sequence ranges (inclusive).
    Ack(Vec<(u32, u32)>),
    /// Negatively acknowledged sequence ranges (inclusive).
    Nak(Vec<(u32, u32)>),
    /// A frame-bearing datagram.
    Frames { sequence: u32, frames: Vec<Frame> },
}

/// Decode one connected datagram.
///
/// # Errors
///
/// `Unexpected` if the valid flag is missing (offline traffic),
/// `ShortRead`/`Malformed` on framing violations.
pub fn decode_datagram(data: &[u8]) -> Result<Datagram, ProtocolError> {
    let mut buf = Bytes::copy_from_slice(data);
    if !buf.has_remaining() {
        return Err(ProtocolError::ShortRead { context: "datagram flags" });
    }
    let flags = buf.get_u8();
    if flags & FLAG_VALID == 0 {
        return Err(ProtocolError::Unexpected {
            id: i32::from(flags),
            expected: "connected datagram",
        });
    }
    if flags & FLAG_ACK != 0 {
        return Ok(Datagram::Ack(decode_ack_records(&mut buf)?));
    }
    if flags & FLAG_NAK != 0 {
        return Ok(Datagram::Nak(decode_ack_records(&mut buf)?));
    }

    let sequence = get_u24_le(&mut buf)?;
    let mut frames = Vec::new();
    while buf.has_remaining() {
        frames.push(Frame::decode(&mut buf)?);
    }
    if frames.is_empty() {
        return Err(ProtocolError::malformed("datagram without frames"));
    }
    Ok(Datagram::Frames { sequence, frames })
}

/// Encode a frame-bearing datagram.
#[must_use]
pub fn encode_frames(sequence: u32, frames: &[Frame]) -> Vec<u8> {
    let size = 4 + frames.iter().map(Frame::encoded_len).sum::<usize>();
    let mut buf = BytesMut::with_capacity(size);
    buf.put_u8(FLAG_VALID);
    put_u24_le(&mut buf, sequence);
    for frame in frames {
        frame.encode_into(&mut buf);
    }
    buf.to_vec()
}

/// Encode an ACK (or NAK) datagram for inclusive sequence ranges.
#[must_use]
pub fn encode_ack(ranges: &[(u32, u32)], nak: bool) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(4 + ranges.len() * 7);
    buf.put_u8(FLAG_VALID | if nak { FLAG_NAK } else { FLAG_ACK });
    buf.put_u16(ranges.len() as u16);
    for &(start, end) in ranges {
        if start == end {
            buf.put_u8(1);
            put_u24_le(&mut buf, start);
        } else {
            buf.put_u8(0);
            put_u24_le(&mut buf, start);
            put_u24_le(&mut buf, end);
        }
    }
    buf.to_vec()
}

fn decode_ack_records(buf: &mut Bytes) -> Result<Vec<(u32, u32)>, ProtocolError> {
    if buf.remaining() < 2 {
        return Err(ProtocolError::ShortRead { context: "ack record count" });
    }
    let count = buf.get_u16();
    let mut records = Vec::with_capacity(usize::from(count.min(64)));
    for _ in 0..count {
        if !buf.has_remaining() {
            return Err(ProtocolError::ShortRead { context: "ack record" });
        }
        if buf.get_u8() == 1 {
            let seq = get_u24_le(buf)?;
            records.push((seq, seq));
        } else {
            let start = get_u24_le(buf)?;
            let end = get_u24_le(buf)?;
            if end < start {
                return Err(ProtocolError::malformed("inverted ack range"));
            }
            records.push((start, end));
        }
    }
    Ok(records)
}

// ============================================================================
// Connected control packets
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionRequest {
    pub client_guid: u64,
    pub send_time: i64,
}

impl ConnectionRequest {
    /// Decode a connection request frame payload.
    ///
    /// # Errors
    ///
    /// `ShortRead`/`Unexpected` on truncated or foreign input.
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        let mut buf = data;
        expect_id(&mut buf, &[ID_CONNECTION_REQUEST])?;
        if buf.remaining() < 16 {
            return Err(ProtocolError::ShortRead { context: "connection request" });
        }
        let client_guid = buf.get_u64();
        let send_time = buf.get_i64();
        Ok(Self {
            client_guid,
            send_time,
        })
    }

    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(18);
        buf.put_u8(ID_CONNECTION_REQUEST);
        buf.put_u64(self.client_guid);
        buf.put_i64(self.send_time);
        buf.put_u8(0); // no security
        buf.freeze()
    }
}

/// Number of system addresses carried in accepted / new-incoming
/// packets, matching what Bedrock clients send.
const SYSTEM_ADDRESS_COUNT: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionRequestAccepted {
    pub client_address: SocketAddr,
    pub request_time: i64,
    pub accept_time: i64,
}

impl ConnectionRequestAccepted {
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(200);
        buf.put_u8(ID_CONNECTION_REQUEST_ACCEPTED);
        put_address(&mut buf, self.client_address);
        buf.put_u16(0); // system index
        let filler = SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), 19132);
        for _ in 0..SYSTEM_ADDRESS_COUNT {
            put_address(&mut buf, filler);
        }
        buf.put_i64(self.request_time);
        buf.put_i64(self.accept_time);
        buf.freeze()
    }

    /// Decode leniently: the client address up front, the two times
    /// from the tail. The system-address block between them varies by
    /// implementation and is skipped.
    ///
    /// # Errors
    ///
    /// `ShortRead`/`Unexpected` on truncated or foreign input.
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        let mut buf = data;
        expect_id(&mut buf, &[ID_CONNECTION_REQUEST_ACCEPTED])?;
        let client_address = get_address(&mut buf)?;
        if buf.remaining() < 18 {
            return Err(ProtocolError::ShortRead { context: "accepted body" });
        }
        let tail = &buf[buf.remaining() - 16..];
        let request_time = i64::from_be_bytes(tail[0..8].try_into().unwrap_or_default());
        let accept_time = i64::from_be_bytes(tail[8..16].try_into().unwrap_or_default());
        Ok(Self {
            client_address,
            request_time,
            accept_time,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewIncomingConnection {
    pub server_address: SocketAddr,
    pub request_time: i64,
    pub accept_time: i64,
}

impl NewIncomingConnection {
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(200);
        buf.put_u8(ID_NEW_INCOMING_CONNECTION);
        put_address(&mut buf, self.server_address);
        let filler = SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), 19132);
        for _ in 0..SYSTEM_ADDRESS_COUNT {
            put_address(&mut buf, filler);
        }
        buf.put_i64(self.request_time);
        buf.put_i64(self.accept_time);
        buf.freeze()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectedPing {
    pub send_time: i64,
}

impl ConnectedPing {
    /// Decode a connected ping frame payload.
    ///
    /// # Errors
    ///
    /// `ShortRead`/`Unexpected` on truncated or foreign input.
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        let mut buf = data;
        expect_id(&mut buf, &[ID_CONNECTED_PING])?;
        if buf.remaining() < 8 {
            return Err(ProtocolError::ShortRead { context: "connected ping" });
        }
        Ok(Self {
            send_time: buf.get_i64(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectedPong {
    pub ping_time: i64,
    pub pong_time: i64,
}

impl ConnectedPong {
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(17);
        buf.put_u8(ID_CONNECTED_PONG);
        buf.put_i64(self.ping_time);
        buf.put_i64(self.pong_time);
        buf.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn u24_roundtrip() {
        for v in [0u32, 1, 255, 256, 0x00ff_ffff] {
            let mut buf = BytesMut::new();
            put_u24_le(&mut buf, v);
            let mut read = buf.freeze();
            assert_eq!(get_u24_le(&mut read).unwrap(), v);
        }
    }

    #[test]
    fn address_roundtrip() {
        for addr in ["192.168.1.10:19132", "[2001:db8::7]:19133"] {
            let addr: SocketAddr = addr.parse().unwrap();
            let mut buf = BytesMut::new();
            put_address(&mut buf, addr);
            let mut read = buf.freeze();
            assert_eq!(get_address(&mut read).unwrap(), addr);
        }
    }

    #[test]
    fn ping_pong_roundtrip() {
        let ping = UnconnectedPing {
            send_time: 123_456,
            client_guid: 0xdead_beef,
        };
        assert_eq!(UnconnectedPing::decode(&ping.encode()).unwrap(), ping);

        let pong = UnconnectedPong {
            send_time: 123_456,
            server_guid: 42,
            motd: "MCPE;craft-router;0;0".into(),
        };
        assert_eq!(UnconnectedPong::decode(&pong.encode()).unwrap(), pong);
    }

    #[test]
    fn open_connection_roundtrips() {
        let req1 = OpenConnectionRequest1 {
            protocol: RAKNET_PROTOCOL_VERSION,
            mtu: 1400,
        };
        let decoded = OpenConnectionRequest1::decode(&req1.encode()).unwrap();
        assert_eq!(decoded.protocol, RAKNET_PROTOCOL_VERSION);
        assert_eq!(decoded.mtu, 1400);

        let reply1 = OpenConnectionReply1 {
            server_guid: 7,
            mtu: 1400,
        };
        assert_eq!(OpenConnectionReply1::decode(&reply1.encode()).unwrap(), reply1);

        let req2 = OpenConnectionRequest2 {
            server_address: "10.0.0.5:19132".parse().unwrap(),
            mtu: 1400,
            client_guid: 99,
        };
        assert_eq!(OpenConnectionRequest2::decode(&req2.encode()).unwrap(), req2);

        let reply2 = OpenConnectionReply2 {
            server_guid: 7,
            client_address: "198.51.100.3:54321".parse().unwrap(),
            mtu: 1400,
        };
        assert_eq!(OpenConnectionReply2::decode(&reply2.encode()).unwrap(), reply2);
    }

    #[test]
    fn frame_datagram_roundtrip() {
        let frame = Frame::reliable_ordered(5, 3, Bytes::from_static(b"\xfe\x01\x02"));
        let datagram = encode_frames(17, &[frame.clone()]);
        match decode_datagram(&datagram).unwrap() {
            Datagram::Frames { sequence, frames } => {
                assert_eq!(sequence, 17);
                assert_eq!(frames, vec![frame]);
            }
            other => panic!("unexpected datagram {other:?}"),
        }
    }

    #[test]
    fn split_frame_roundtrip() {
        let frame = Frame {
            reliability: Reliability::ReliableOrdered,
            reliable_index: Some(1),
            sequenced_index: None,
            ordered: Some((0, 0)),
            split: Some(SplitInfo {
                count: 3,
                id: 9,
                index: 1,
            }),
            payload: Bytes::from_static(b"chunk"),
        };
        let datagram = encode_frames(0, &[frame.clone()]);
        match decode_datagram(&datagram).unwrap() {
            Datagram::Frames { frames, .. } => assert_eq!(frames[0], frame),
            other => panic!("unexpected datagram {other:?}"),
        }
    }

    #[test]
    fn ack_roundtrip() {
        let ranges = vec![(3, 3), (10, 14)];
        let encoded = encode_ack(&ranges, false);
        match decode_datagram(&encoded).unwrap() {
            Datagram::Ack(decoded) => assert_eq!(decoded, ranges),
            other => panic!("unexpected datagram {other:?}"),
        }
    }

    #[test]
    fn offline_traffic_is_not_a_datagram() {
        let ping = UnconnectedPing {
            send_time: 0,
            client_guid: 1,
        };
        assert!(matches!(
            decode_datagram(&ping.encode()),
            Err(ProtocolError::Unexpected { .. })
        ));
    }

    #[test]
    fn connection_request_roundtrip() {
        let req = ConnectionRequest {
            client_guid: 77,
            send_time: 1000,
        };
        assert_eq!(ConnectionRequest::decode(&req.encode()).unwrap(), req);
    }

    #[test]
    fn accepted_decodes_own_encoding() {
        let accepted = ConnectionRequestAccepted {
            client_address: "203.0.113.9:54321".parse().unwrap(),
            request_time: 11,
            accept_time: 22,
        };
        let decoded = ConnectionRequestAccepted::decode(&accepted.encode()).unwrap();
        assert_eq!(decoded, accepted);
    }
}
