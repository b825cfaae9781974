//! HAProxy PROXY protocol v1/v2 support
//!
//! Listeners configured with `receive_proxy_protocol` read a PROXY
//! header from trusted peers and adopt the declared source address;
//! routes configured with `send_proxy_protocol` prepend a v2 header to
//! the upstream connection.
//!
//! Wire format (v2):
//!
//! ```text
//! Signature (12 bytes)      0D 0A 0D 0A 00 0D 0A 51 55 49 54 0A
//! Version/Command (1 byte)  0x21 = v2 PROXY
//! Family/Protocol (1 byte)  0x11 = INET/STREAM, 0x21 = INET6/STREAM,
//!                           0x12 = INET/DGRAM,  0x22 = INET6/DGRAM
//! Address length (2 bytes, big-endian)
//! Addresses                 src, dst, src port, dst port
//! ```
//!
//! v1 is the human-readable `PROXY TCP4 <src> <dst> <sport> <dport>\r\n`
//! line and is accepted on the inbound side only.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::ConnectionError;

/// PROXY protocol v2 signature.
const V2_SIGNATURE: [u8; 12] = [
    0x0d, 0x0a, 0x0d, 0x0a, 0x00, 0x0d, 0x0a, 0x51, 0x55, 0x49, 0x54, 0x0a,
];

/// Version 2 with PROXY command.
const V2_VERSION_PROXY: u8 = 0x21;

/// Version 2 with LOCAL command (health checks); addresses are ignored.
const V2_VERSION_LOCAL: u8 = 0x20;

const FAMILY_INET_STREAM: u8 = 0x11;
const FAMILY_INET6_STREAM: u8 = 0x21;
const FAMILY_INET_DGRAM: u8 = 0x12;
const FAMILY_INET6_DGRAM: u8 = 0x22;

/// Longest accepted v1 line, per the HAProxy spec.
const V1_MAX_LINE: usize = 107;

/// A parsed PROXY header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyHeader {
    /// Declared original client address.
    pub source: SocketAddr,
    /// Declared original destination address.
    pub destination: SocketAddr,
}

/// Read a PROXY v1 or v2 header from the stream.
///
/// The first byte decides the version: `0x0d` starts the v2 signature,
/// `b'P'` starts a v1 line. Anything else fails the connection, since
/// the caller has already decided this peer must speak PROXY protocol.
///
/// Returns `None` for a v2 LOCAL command (the connection proceeds with
/// its transport address).
///
/// # Errors
///
/// `ProxyProtocol` on any malformed header; `Io` on transport failure.
pub async fn read_header<R>(stream: &mut R) -> Result<Option<ProxyHeader>, ConnectionError>
where
    R: AsyncRead + Unpin,
{
    let first = stream.read_u8().await?;
    match first {
        0x0d => read_v2(stream).await,
        b'P' => read_v1(stream).await.map(Some),
        other => Err(ConnectionError::ProxyProtocol(format!(
            "unrecognised first byte {other:#04x}"
        ))),
    }
}

async fn read_v2<R>(stream: &mut R) -> Result<Option<ProxyHeader>, ConnectionError>
where
    R: AsyncRead + Unpin,
{
    // First signature byte was consumed by the dispatcher.
    let mut sig = [0u8; 11];
    stream.read_exact(&mut sig).await?;
    if sig != V2_SIGNATURE[1..] {
        return Err(ConnectionError::ProxyProtocol("bad v2 signature".into()));
    }

    let version_command = stream.read_u8().await?;
    let family = stream.read_u8().await?;
    let mut len_bytes = [0u8; 2];
    stream.read_exact(&mut len_bytes).await?;
    let addr_len = u16::from_be_bytes(len_bytes) as usize;

    let mut addrs = vec![0u8; addr_len];
    stream.read_exact(&mut addrs).await?;

    match version_command {
        V2_VERSION_LOCAL => return Ok(None),
        V2_VERSION_PROXY => {}
        other => {
            return Err(ConnectionError::ProxyProtocol(format!(
                "unsupported version/command {other:#04x}"
            )))
        }
    }

    match family {
        FAMILY_INET_STREAM | FAMILY_INET_DGRAM => {
            if addrs.len() < 12 {
                return Err(ConnectionError::ProxyProtocol(
                    "short IPv4 address block".into(),
                ));
            }
            let src_ip = Ipv4Addr::new(addrs[0], addrs[1], addrs[2], addrs[3]);
            let dst_ip = Ipv4Addr::new(addrs[4], addrs[5], addrs[6], addrs[7]);
            let src_port = u16::from_be_bytes([addrs[8], addrs[9]]);
            let dst_port = u16::from_be_bytes([addrs[10], addrs[11]]);
            Ok(Some(ProxyHeader {
                source: SocketAddr::new(IpAddr::V4(src_ip), src_port),
                destination: SocketAddr::new(IpAddr::V4(dst_ip), dst_port),
            }))
        }
        FAMILY_INET6_STREAM | FAMILY_INET6_DGRAM => {
            if addrs.len() < 36 {
                return Err(ConnectionError::ProxyProtocol(
                    "short IPv6 address block".into(),
                ));
            }
            let mut src = [0u8; 16];
            let mut dst = [0u8; 16];
            src.copy_from_slice(&addrs[0..16]);
            dst.copy_from_slice(&addrs[16..32]);
            let src_port = u16::from_be_bytes([addrs[32], addrs[33]]);
            let dst_port = u16::from_be_bytes([addrs[34], addrs[35]]);
            Ok(Some(ProxyHeader {
                source: SocketAddr::new(IpAddr::V6(Ipv6Addr::from(src)), src_port),
                destination: SocketAddr::new(IpAddr::V6(Ipv6Addr::from(dst)), dst_port),
            }))
        }
        other => Err(ConnectionError::ProxyProtocol(format!(
            "unsupported address family {other:#04x}"
        ))),
    }
}

async fn read_v1<R>(stream: &mut R) -> Result<ProxyHeader, ConnectionError>
where
    R: AsyncRead + Unpin,
{
    // 'P' was consumed; read the rest of the line up to CRLF.
    let mut line = Vec::with_capacity(64);
    line.push(b'P');
    loop {
        let b = stream.read_u8().await?;
        line.push(b);
        if b == b'\n' {
            break;
        }
        if line.len() > V1_MAX_LINE {
            return Err(ConnectionError::ProxyProtocol("v1 line too long".into()));
        }
    }

    let line = std::str::from_utf8(&line)
        .map_err(|_| ConnectionError::ProxyProtocol("v1 line is not UTF-8".into()))?;
    let line = line
        .strip_suffix("\r\n")
        .ok_or_else(|| ConnectionError::ProxyProtocol("v1 line missing CRLF".into()))?;

    let mut parts = line.split(' ');
    let (Some("PROXY"), Some(proto)) = (parts.next(), parts.next()) else {
        return Err(ConnectionError::ProxyProtocol("bad v1 preamble".into()));
    };
    match proto {
        "TCP4" | "TCP6" => {}
        "UNKNOWN" => {
            return Err(ConnectionError::ProxyProtocol(
                "v1 UNKNOWN protocol".into(),
            ))
        }
        other => {
            return Err(ConnectionError::ProxyProtocol(format!(
                "bad v1 protocol '{other}'"
            )))
        }
    }

    let fields: Vec<&str> = parts.collect();
    if fields.len() != 4 {
        return Err(ConnectionError::ProxyProtocol(format!(
            "v1 expected 4 address fields, got {}",
            fields.len()
        )));
    }
    let src_ip: IpAddr = fields[0]
        .parse()
        .map_err(|_| ConnectionError::ProxyProtocol("bad v1 source ip".into()))?;
    let dst_ip: IpAddr = fields[1]
        .parse()
        .map_err(|_| ConnectionError::ProxyProtocol("bad v1 destination ip".into()))?;
    let src_port: u16 = fields[2]
        .parse()
        .map_err(|_| ConnectionError::ProxyProtocol("bad v1 source port".into()))?;
    let dst_port: u16 = fields[3]
        .parse()
        .map_err(|_| ConnectionError::ProxyProtocol("bad v1 destination port".into()))?;

    Ok(ProxyHeader {
        source: SocketAddr::new(src_ip, src_port),
        destination: SocketAddr::new(dst_ip, dst_port),
    })
}

/// Encode a PROXY v2 header for emission to an upstream.
///
/// Mixed address families are coerced to the source's family with an
/// unspecified destination, matching what upstream servers expect from
/// a single-family header.
#[must_use]
pub fn encode_v2(source: SocketAddr, destination: SocketAddr, datagram: bool) -> Vec<u8> {
    let (source, destination) = match (source, destination) {
        (SocketAddr::V4(_), SocketAddr::V4(_)) | (SocketAddr::V6(_), SocketAddr::V6(_)) => {
            (source, destination)
        }
        (SocketAddr::V4(s), SocketAddr::V6(_)) => (
            SocketAddr::V4(s),
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), destination.port()),
        ),
        (SocketAddr::V6(s), SocketAddr::V4(_)) => (
            SocketAddr::V6(s),
            SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), destination.port()),
        ),
    };

    let mut buf = Vec::with_capacity(16 + 36);
    buf.extend_from_slice(&V2_SIGNATURE);
    buf.push(V2_VERSION_PROXY);

    match (source.ip(), destination.ip()) {
        (IpAddr::V4(src), IpAddr::V4(dst)) => {
            buf.push(if datagram {
                FAMILY_INET_DGRAM
            } else {
                FAMILY_INET_STREAM
            });
            buf.extend_from_slice(&12u16.to_be_bytes());
            buf.extend_from_slice(&src.octets());
            buf.extend_from_slice(&dst.octets());
            buf.extend_from_slice(&source.port().to_be_bytes());
            buf.extend_from_slice(&destination.port().to_be_bytes());
        }
        (IpAddr::V6(src), IpAddr::V6(dst)) => {
            buf.push(if datagram {
                FAMILY_INET6_DGRAM
            } else {
                FAMILY_INET6_STREAM
            });
            buf.extend_from_slice(&36u16.to_be_bytes());
            buf.extend_from_slice(&src.octets());
            buf.extend_from_slice(&dst.octets());
            buf.extend_from_slice(&source.port().to_be_bytes());
            buf.extend_from_slice(&destination.port().to_be_bytes());
        }
        // Coerced above; families always agree here.
        _ => unreachable!("mixed address families after coercion"),
    }

    buf
}
