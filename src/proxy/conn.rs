//! Processed connections
//!
//! A [`ProcessedConn`] is what the handshake processor hands to the
//! matcher: the still-open client stream, the parsed routing intent,
//! and the prelude bytes that must be replayed to the upstream before
//! any pumped byte.

use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

use crate::bedrock::RaknetStream;
use crate::event::ConnSnapshot;
use crate::java::packets::{Handshake, NextState};
use crate::Edition;

/// A client or upstream stream, tagged by edition.
///
/// Java connections are plain TCP; Bedrock sessions present the same
/// interface through their RakNet virtual stream, so everything above
/// the codec layer is edition-agnostic.
#[derive(Debug)]
pub enum EditionStream {
    Tcp(TcpStream),
    Raknet(RaknetStream),
}

impl EditionStream {
    /// The edition this stream belongs to.
    #[must_use]
    pub fn edition(&self) -> Edition {
        match self {
            Self::Tcp(_) => Edition::Java,
            Self::Raknet(_) => Edition::Bedrock,
        }
    }
}

impl AsyncRead for EditionStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            Self::Raknet(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for EditionStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Self::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            Self::Raknet(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            Self::Raknet(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            Self::Raknet(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

/// A connection whose handshake has been parsed.
#[derive(Debug)]
pub struct ProcessedConn {
    /// The client stream, positioned just past the consumed prelude.
    pub stream: EditionStream,
    pub edition: Edition,
    /// Client address, after any PROXY protocol rewrite.
    pub remote_addr: SocketAddr,
    /// The listener address the client reached us on.
    pub local_addr: SocketAddr,
    /// Gate of the accepting listener; filters the route table.
    pub gate_id: String,
    /// Sanitized requested host.
    pub requested_host: String,
    pub requested_port: u16,
    /// Known for Java login-state and all Bedrock connections.
    pub username: Option<String>,
    pub protocol_version: i32,
    pub next_state: NextState,
    /// Java only: the parsed handshake, kept for real-IP rewriting.
    pub handshake: Option<Handshake>,
    /// Java login-state only: the raw framed `LoginStart`.
    pub login_raw: Option<Vec<u8>>,
    /// Exact bytes consumed during processing, replayed to the
    /// upstream exactly once before the pump starts.
    pub prelude: Vec<u8>,
}

impl ProcessedConn {
    /// Immutable view for event payloads.
    #[must_use]
    pub fn snapshot(&self) -> ConnSnapshot {
        ConnSnapshot {
            edition: self.edition,
            remote_addr: self.remote_addr,
            local_addr: self.local_addr,
            gate_id: self.gate_id.clone(),
            requested_host: self.requested_host.clone(),
            requested_port: self.requested_port,
            username: self.username.clone(),
            protocol_version: self.protocol_version,
        }
    }
}
