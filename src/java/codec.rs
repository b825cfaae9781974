//! Java edition packet framing
//!
//! Every Java edition packet on the wire is framed as:
//!
//! ```text
//! Length (VarInt)   -- size of everything after this field
//! PacketID (VarInt)
//! Payload (variable)
//! ```
//!
//! VarInts are the Minecraft 32-bit little-endian-group encoding: seven
//! data bits per byte, high bit set on continuation, at most five bytes.
//!
//! The codec is split into pure buffer functions (used by the typed
//! packet unmarshallers) and async frame readers that pull exactly one
//! frame off a stream. Frame readers also hand back the raw bytes they
//! consumed so the processor can accumulate the handshake prelude for
//! replay to the upstream.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ProtocolError;

/// Upper bound on a single framed packet (length field), per protocol.
pub const MAX_PACKET_LEN: usize = 1 << 21;

/// Upper bound on the handshake server-address string.
pub const MAX_SERVER_ADDRESS_LEN: usize = 255;

/// A decoded Java edition packet: ID plus opaque payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub id: i32,
    pub payload: Bytes,
}

impl Packet {
    /// Build a packet from an ID and an already-marshalled payload.
    #[must_use]
    pub fn new(id: i32, payload: Bytes) -> Self {
        Self { id, payload }
    }

    /// Encode this packet into its on-the-wire frame.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut body = BytesMut::with_capacity(self.payload.len() + 5);
        write_varint(&mut body, self.id);
        body.extend_from_slice(&self.payload);

        let mut frame = BytesMut::with_capacity(body.len() + 5);
        write_varint(&mut frame, body.len() as i32);
        frame.extend_from_slice(&body);
        frame.to_vec()
    }
}

/// Read a VarInt from a buffer.
///
/// # Errors
///
/// `ShortRead` if the buffer ends mid-varint, `Malformed` if the varint
/// exceeds five bytes.
pub fn read_varint(buf: &mut impl Buf) -> Result<i32, ProtocolError> {
    let mut value: i32 = 0;
    let mut shift: u32 = 0;
    loop {
        if !buf.has_remaining() {
            return Err(ProtocolError::ShortRead { context: "varint" });
        }
        let b = buf.get_u8();
        value |= i32::from(b & 0x7f) << shift;
        if b & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
        if shift >= 35 {
            return Err(ProtocolError::malformed("varint longer than 5 bytes"));
        }
    }
}

/// Write a VarInt to a buffer.
pub fn write_varint(buf: &mut BytesMut, value: i32) {
    let mut v = value as u32;
    loop {
        let b = (v & 0x7f) as u8;
        v >>= 7;
        if v == 0 {
            buf.put_u8(b);
            return;
        }
        buf.put_u8(b | 0x80);
    }
}

/// Number of bytes a VarInt occupies on the wire.
#[must_use]
pub fn varint_len(value: i32) -> usize {
    let mut v = value as u32;
    let mut n = 1;
    while v >= 0x80 {
        v >>= 7;
        n += 1;
    }
    n
}

/// Read a VarInt-length-prefixed UTF-8 string from a buffer.
///
/// # Errors
///
/// `Malformed` on negative length, length above `max_len`, truncated
/// bytes, or invalid UTF-8.
pub fn read_string(buf: &mut impl Buf, max_len: usize) -> Result<String, ProtocolError> {
    let len = read_varint(buf)?;
    if len < 0 {
        return Err(ProtocolError::malformed("negative string length"));
    }
    let len = len as usize;
    if len > max_len * 4 {
        return Err(ProtocolError::malformed(format!(
            "string length {len} exceeds maximum {max_len}"
        )));
    }
    if buf.remaining() < len {
        return Err(ProtocolError::ShortRead { context: "string body" });
    }
    let mut bytes = vec![0u8; len];
    buf.copy_to_slice(&mut bytes);
    String::from_utf8(bytes).map_err(|_| ProtocolError::malformed("string is not valid UTF-8"))
}

/// Write a VarInt-length-prefixed UTF-8 string to a buffer.
pub fn write_string(buf: &mut BytesMut, s: &str) {
    write_varint(buf, s.len() as i32);
    buf.extend_from_slice(s.as_bytes());
}

/// Read one framed packet from a stream.
///
/// Returns the decoded packet together with the exact bytes consumed
/// from the stream (length prefix included), so callers can replay them
/// verbatim.
///
/// # Errors
///
/// `Malformed` / `PacketTooLarge` on framing violations, `Io` on
/// transport failure. A clean EOF before the first byte surfaces as
/// `Io(UnexpectedEof)`.
pub async fn read_packet<R>(stream: &mut R) -> Result<(Packet, Vec<u8>), ProtocolError>
where
    R: AsyncRead + Unpin,
{
    // Length varint arrives byte-by-byte; cap at five bytes.
    let mut raw = Vec::with_capacity(64);
    let mut length: i32 = 0;
    let mut shift: u32 = 0;
    loop {
        let b = stream.read_u8().await?;
        raw.push(b);
        length |= i32::from(b & 0x7f) << shift;
        if b & 0x80 == 0 {
            break;
        }
        shift += 7;
        if shift >= 35 {
            return Err(ProtocolError::malformed("length varint longer than 5 bytes"));
        }
    }

    if length < 0 {
        return Err(ProtocolError::malformed("negative packet length"));
    }
    let length = length as usize;
    if length > MAX_PACKET_LEN {
        return Err(ProtocolError::PacketTooLarge {
            length,
            max: MAX_PACKET_LEN,
        });
    }
    if length == 0 {
        return Err(ProtocolError::malformed("empty packet body"));
    }

    let body_start = raw.len();
    raw.resize(body_start + length, 0);
    stream.read_exact(&mut raw[body_start..]).await?;

    let mut body = Bytes::copy_from_slice(&raw[body_start..]);
    let id = read_varint(&mut body)?;
    Ok((Packet::new(id, body), raw))
}

/// Write one framed packet to a stream.
///
/// # Errors
///
/// Propagates transport errors.
pub async fn write_packet<W>(stream: &mut W, packet: &Packet) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    stream.write_all(&packet.encode()).await?;
    Ok(())
}
