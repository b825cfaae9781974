//! RakNet sessions and datagram demultiplexing
//!
//! One UDP socket serves many clients. The listener demultiplexes
//! incoming datagrams by peer address into per-session channels; each
//! session runs the RakNet state machine on its own task and exposes
//! the application payloads through a [`RaknetStream`] implementing
//! `AsyncRead + AsyncWrite`, so everything above this layer treats a
//! Bedrock session exactly like a TCP connection.
//!
//! ```text
//! UDP socket -> demux loop -> DashMap<peer, raw channel> -> session task
//!                                                               |
//!                                frames, ACKs, split reassembly |
//!                                                               v
//!                                    RaknetStream (AsyncRead/AsyncWrite)
//! ```
//!
//! The same session state machine also runs on the dialing side: the
//! upstream dialer performs the client half of the open-connection
//! exchange and returns the identical stream type.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::raknet::{
    self, ConnectedPing, ConnectedPong, ConnectionRequest, ConnectionRequestAccepted, Datagram,
    Frame, IncompatibleProtocolVersion, NewIncomingConnection, OpenConnectionReply1,
    OpenConnectionReply2, OpenConnectionRequest1, OpenConnectionRequest2, SplitInfo,
    UnconnectedPing, UnconnectedPong, FLAG_VALID, FRAME_OVERHEAD, MAX_MTU,
    RAKNET_PROTOCOL_VERSION,
};
use crate::error::ConnectionError;

/// MTU offered when dialing upstream.
pub const DEFAULT_MTU: u16 = 1400;

/// Raw datagrams queued per session before the demux loop drops.
const RAW_QUEUE: usize = 128;

/// Application payloads queued per session.
const APP_QUEUE: usize = 64;

/// How a session sends datagrams to its peer.
enum Outlet {
    /// The listener's shared socket; datagrams target the peer address.
    Shared {
        socket: Arc<UdpSocket>,
        peer: SocketAddr,
    },
    /// A connected socket owned by a dialed session.
    Connected(Arc<UdpSocket>),
}

impl Outlet {
    async fn send(&self, data: &[u8]) -> io::Result<()> {
        match self {
            Self::Shared { socket, peer } => {
                socket.send_to(data, *peer).await?;
            }
            Self::Connected(socket) => {
                socket.send(data).await?;
            }
        }
        Ok(())
    }
}

/// A RakNet session presented as a byte stream of application payloads.
///
/// Each `read` yields one application payload (game packet); each
/// `write` becomes one outgoing payload, split into fragments when it
/// exceeds the session MTU.
#[derive(Debug)]
pub struct RaknetStream {
    peer: SocketAddr,
    incoming: mpsc::Receiver<Bytes>,
    pending: Bytes,
    outgoing: mpsc::UnboundedSender<Bytes>,
}

impl RaknetStream {
    /// The remote peer of this session.
    #[must_use]
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
}

impl AsyncRead for RaknetStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            if !self.pending.is_empty() {
                let n = self.pending.len().min(buf.remaining());
                buf.put_slice(&self.pending.split_to(n));
                return Poll::Ready(Ok(()));
            }
            match self.incoming.poll_recv(cx) {
                Poll::Ready(Some(payload)) => self.pending = payload,
                // Session ended: EOF.
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl AsyncWrite for RaknetStream {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.outgoing.send(Bytes::copy_from_slice(buf)) {
            Ok(()) => Poll::Ready(Ok(buf.len())),
            Err(_) => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "raknet session closed",
            ))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Which half of the connected handshake this session plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    /// Accepts a client (the listener side).
    Server,
    /// Dials an upstream (the proxy acts as a RakNet client).
    Client,
}

struct SplitAssembly {
    parts: Vec<Option<Bytes>>,
    received: u32,
}

enum Flow {
    Continue,
    Close,
}

struct SessionCore {
    role: Role,
    outlet: Outlet,
    peer: SocketAddr,
    mtu: u16,
    guid: u64,
    send_sequence: u32,
    reliable_index: u32,
    order_index: u32,
    split_id: u16,
    splits: HashMap<u16, SplitAssembly>,
    app_tx: mpsc::Sender<Bytes>,
    connected_tx: Option<oneshot::Sender<()>>,
}

impl SessionCore {
    async fn handle_raw(&mut self, data: Bytes) -> io::Result<Flow> {
        let datagram = match raknet::decode_datagram(&data) {
            Ok(d) => d,
            Err(e) => {
                trace!(peer = %self.peer, error = %e, "dropping undecodable datagram");
                return Ok(Flow::Continue);
            }
        };
        match datagram {
            // TODO: retransmit frames named in NAK records instead of
            // relying on the peer's application-level recovery.
            Datagram::Ack(_) | Datagram::Nak(_) => Ok(Flow::Continue),
            Datagram::Frames { sequence, frames } => {
                self.outlet
                    .send(&raknet::encode_ack(&[(sequence, sequence)], false))
                    .await?;
                for frame in frames {
                    if let Some(payload) = self.reassemble(frame) {
                        if let Flow::Close = self.handle_payload(payload).await? {
                            return Ok(Flow::Close);
                        }
                    }
                }
                Ok(Flow::Continue)
            }
        }
    }

    /// Collect split fragments; returns a payload once complete.
    fn reassemble(&mut self, frame: Frame) -> Option<Bytes> {
        let Some(split) = frame.split else {
            return Some(frame.payload);
        };
        if split.count == 0 || split.count > 4096 || split.index >= split.count {
            warn!(peer = %self.peer, "invalid split header, dropping fragment");
            return None;
        }
        let assembly = self.splits.entry(split.id).or_insert_with(|| SplitAssembly {
            parts: vec![None; split.count as usize],
            received: 0,
        });
        let slot = &mut assembly.parts[split.index as usize];
        if slot.is_none() {
            *slot = Some(frame.payload);
            assembly.received += 1;
        }
        if assembly.received < split.count {
            return None;
        }
        let assembly = self.splits.remove(&split.id)?;
        let mut whole = BytesMut::new();
        for part in assembly.parts.into_iter().flatten() {
            whole.extend_from_slice(&part);
        }
        Some(whole.freeze())
    }

    async fn handle_payload(&mut self, payload: Bytes) -> io::Result<Flow> {
        let Some(&id) = payload.first() else {
            return Ok(Flow::Continue);
        };
        match id {
            raknet::ID_CONNECTION_REQUEST if self.role == Role::Server => {
                if let Ok(request) = ConnectionRequest::decode(&payload) {
                    let accepted = ConnectionRequestAccepted {
                        client_address: self.peer,
                        request_time: request.send_time,
                        accept_time: request.send_time,
                    };
                    self.send_payload(accepted.encode()).await?;
                }
                Ok(Flow::Continue)
            }
            raknet::ID_CONNECTION_REQUEST_ACCEPTED if self.role == Role::Client => {
                if let Ok(accepted) = ConnectionRequestAccepted::decode(&payload) {
                    let incoming = NewIncomingConnection {
                        server_address: self.peer,
                        request_time: accepted.request_time,
                        accept_time: accepted.accept_time,
                    };
                    self.send_payload(incoming.encode()).await?;
                    self.signal_connected();
                }
                Ok(Flow::Continue)
            }
            raknet::ID_NEW_INCOMING_CONNECTION if self.role == Role::Server => {
                self.signal_connected();
                Ok(Flow::Continue)
            }
            raknet::ID_CONNECTED_PING => {
                if let Ok(ping) = ConnectedPing::decode(&payload) {
                    let pong = ConnectedPong {
                        ping_time: ping.send_time,
                        pong_time: ping.send_time,
                    };
                    self.send_payload(pong.encode()).await?;
                }
                Ok(Flow::Continue)
            }
            raknet::ID_CONNECTED_PONG => Ok(Flow::Continue),
            raknet::ID_DISCONNECT_NOTIFICATION => {
                debug!(peer = %self.peer, "peer sent disconnect notification");
                Ok(Flow::Close)
            }
            raknet::ID_GAME_PACKET => {
                // Application traffic: hand the whole payload upward.
                if self.app_tx.send(payload).await.is_err() {
                    return Ok(Flow::Close);
                }
                Ok(Flow::Continue)
            }
            other => {
                trace!(peer = %self.peer, id = other, "ignoring unhandled connected packet");
                Ok(Flow::Continue)
            }
        }
    }

    fn signal_connected(&mut self) {
        if let Some(tx) = self.connected_tx.take() {
            let _ = tx.send(());
        }
    }

    /// Frame an application payload and send it, splitting when it
    /// exceeds the per-datagram budget.
    async fn send_payload(&mut self, payload: Bytes) -> io::Result<()> {
        let budget = usize::from(self.mtu.saturating_sub(FRAME_OVERHEAD).max(64));
        let order_index = self.order_index;
        self.order_index = self.order_index.wrapping_add(1);

        if payload.len() <= budget {
            let reliable_index = self.next_reliable_index();
            let frame = Frame::reliable_ordered(reliable_index, order_index, payload);
            return self.send_frames(vec![frame]).await;
        }

        let split_id = self.split_id;
        self.split_id = self.split_id.wrapping_add(1);
        let count = payload.len().div_ceil(budget) as u32;
        for (index, chunk) in payload.chunks(budget).enumerate() {
            let reliable_index = self.next_reliable_index();
            let mut frame = Frame::reliable_ordered(
                reliable_index,
                order_index,
                Bytes::copy_from_slice(chunk),
            );
            frame.split = Some(SplitInfo {
                count,
                id: split_id,
                index: index as u32,
            });
            self.send_frames(vec![frame]).await?;
        }
        Ok(())
    }

    fn next_reliable_index(&mut self) -> u32 {
        let index = self.reliable_index;
        self.reliable_index = self.reliable_index.wrapping_add(1);
        index
    }

    async fn send_frames(&mut self, frames: Vec<Frame>) -> io::Result<()> {
        let sequence = self.send_sequence;
        self.send_sequence = self.send_sequence.wrapping_add(1);
        self.outlet
            .send(&raknet::encode_frames(sequence, &frames))
            .await
    }

    async fn send_disconnect(&mut self) {
        let payload = Bytes::from_static(&[raknet::ID_DISCONNECT_NOTIFICATION]);
        let _ = self.send_payload(payload).await;
    }
}

async fn run_session(
    mut core: SessionCore,
    mut raw_rx: mpsc::Receiver<Bytes>,
    mut out_rx: mpsc::UnboundedReceiver<Bytes>,
) {
    if core.role == Role::Client {
        let request = ConnectionRequest {
            client_guid: core.guid,
            send_time: 0,
        };
        if let Err(e) = core.send_payload(request.encode()).await {
            warn!(peer = %core.peer, error = %e, "failed to send connection request");
            return;
        }
    }

    loop {
        tokio::select! {
            raw = raw_rx.recv() => match raw {
                Some(data) => match core.handle_raw(data).await {
                    Ok(Flow::Continue) => {}
                    Ok(Flow::Close) => break,
                    Err(e) => {
                        debug!(peer = %core.peer, error = %e, "session send failed");
                        break;
                    }
                },
                None => break,
            },
            out = out_rx.recv() => match out {
                Some(payload) => {
                    if let Err(e) = core.send_payload(payload).await {
                        debug!(peer = %core.peer, error = %e, "session send failed");
                        break;
                    }
                }
                // Stream dropped: tell the peer and wind down.
                None => {
                    core.send_disconnect().await;
                    break;
                }
            },
        }
    }
    debug!(peer = %core.peer, "raknet session ended");
}

/// A freshly accepted RakNet session.
pub struct NewSession {
    pub stream: RaknetStream,
    pub peer: SocketAddr,
}

/// A RakNet listener demultiplexing one UDP socket into sessions.
pub struct RaknetListener {
    local_addr: SocketAddr,
    accept_rx: mpsc::Receiver<NewSession>,
    demux_task: JoinHandle<()>,
}

impl RaknetListener {
    /// Bind a UDP socket and start the demux loop.
    ///
    /// `motd` is served in unconnected pong replies; `server_guid`
    /// identifies this listener in the offline handshake.
    ///
    /// # Errors
    ///
    /// Propagates the bind failure.
    pub async fn bind(bind: SocketAddr, motd: String, server_guid: u64) -> io::Result<Self> {
        let socket = Arc::new(UdpSocket::bind(bind).await?);
        let local_addr = socket.local_addr()?;
        let (accept_tx, accept_rx) = mpsc::channel(16);
        let sessions: Arc<DashMap<SocketAddr, mpsc::Sender<Bytes>>> = Arc::new(DashMap::new());

        let demux_task = tokio::spawn(demux_loop(
            socket,
            sessions,
            accept_tx,
            motd,
            server_guid,
            local_addr.port(),
        ));

        Ok(Self {
            local_addr,
            accept_rx,
            demux_task,
        })
    }

    /// Wait for the next session. `None` after the listener is closed.
    pub async fn accept(&mut self) -> Option<NewSession> {
        self.accept_rx.recv().await
    }

    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Drop for RaknetListener {
    fn drop(&mut self) {
        // Stops the demux loop; live sessions keep their socket clone
        // and drain independently.
        self.demux_task.abort();
    }
}

async fn demux_loop(
    socket: Arc<UdpSocket>,
    sessions: Arc<DashMap<SocketAddr, mpsc::Sender<Bytes>>>,
    accept_tx: mpsc::Sender<NewSession>,
    motd: String,
    server_guid: u64,
    port: u16,
) {
    let mut buf = vec![0u8; usize::from(MAX_MTU) + 64];
    loop {
        let (len, peer) = match socket.recv_from(&mut buf).await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "udp receive error");
                continue;
            }
        };
        let data = &buf[..len];
        let Some(&first) = data.first() else { continue };

        if first & FLAG_VALID != 0 {
            // Connected traffic for an established session.
            if let Some(entry) = sessions.get(&peer) {
                if entry.try_send(Bytes::copy_from_slice(data)).is_err() {
                    trace!(peer = %peer, "session raw queue full, dropping datagram");
                }
            }
            continue;
        }

        match first {
            raknet::ID_UNCONNECTED_PING | raknet::ID_UNCONNECTED_PING_OPEN => {
                if let Ok(ping) = UnconnectedPing::decode(data) {
                    let pong = UnconnectedPong {
                        send_time: ping.send_time,
                        server_guid,
                        motd: format_motd(&motd, server_guid, port),
                    };
                    let _ = socket.send_to(&pong.encode(), peer).await;
                }
            }
            raknet::ID_OPEN_CONNECTION_REQUEST_1 => {
                match OpenConnectionRequest1::decode(data) {
                    Ok(request) if request.protocol == RAKNET_PROTOCOL_VERSION => {
                        let reply = OpenConnectionReply1 {
                            server_guid,
                            mtu: request.mtu.min(MAX_MTU),
                        };
                        let _ = socket.send_to(&reply.encode(), peer).await;
                    }
                    Ok(request) => {
                        debug!(peer = %peer, protocol = request.protocol, "incompatible raknet protocol");
                        let reply = IncompatibleProtocolVersion {
                            protocol: RAKNET_PROTOCOL_VERSION,
                            server_guid,
                        };
                        let _ = socket.send_to(&reply.encode(), peer).await;
                    }
                    Err(e) => trace!(peer = %peer, error = %e, "bad open connection request 1"),
                }
            }
            raknet::ID_OPEN_CONNECTION_REQUEST_2 => {
                let request = match OpenConnectionRequest2::decode(data) {
                    Ok(r) => r,
                    Err(e) => {
                        trace!(peer = %peer, error = %e, "bad open connection request 2");
                        continue;
                    }
                };
                let reply = OpenConnectionReply2 {
                    server_guid,
                    client_address: peer,
                    mtu: request.mtu.min(MAX_MTU),
                };
                if socket.send_to(&reply.encode(), peer).await.is_err() {
                    continue;
                }
                if sessions.contains_key(&peer) {
                    // Duplicate request-2; the reply above suffices.
                    continue;
                }

                let (raw_tx, raw_rx) = mpsc::channel(RAW_QUEUE);
                let (app_tx, app_rx) = mpsc::channel(APP_QUEUE);
                let (out_tx, out_rx) = mpsc::unbounded_channel();
                let core = SessionCore {
                    role: Role::Server,
                    outlet: Outlet::Shared {
                        socket: socket.clone(),
                        peer,
                    },
                    peer,
                    mtu: request.mtu.min(MAX_MTU),
                    guid: server_guid,
                    send_sequence: 0,
                    reliable_index: 0,
                    order_index: 0,
                    split_id: 0,
                    splits: HashMap::new(),
                    app_tx,
                    connected_tx: None,
                };
                sessions.insert(peer, raw_tx);
                let sessions_for_cleanup = sessions.clone();
                tokio::spawn(async move {
                    run_session(core, raw_rx, out_rx).await;
                    sessions_for_cleanup.remove(&peer);
                });

                let session = NewSession {
                    stream: RaknetStream {
                        peer,
                        incoming: app_rx,
                        pending: Bytes::new(),
                        outgoing: out_tx,
                    },
                    peer,
                };
                if accept_tx.send(session).await.is_err() {
                    return;
                }
                debug!(peer = %peer, mtu = request.mtu, "raknet session opened");
            }
            other => {
                trace!(peer = %peer, id = other, "ignoring offline packet");
            }
        }
    }
}

/// Build the semicolon-delimited pong MOTD string Bedrock clients parse.
fn format_motd(motd: &str, server_guid: u64, port: u16) -> String {
    format!("MCPE;{motd};0;0.0;0;0;{server_guid};craft-router;Survival;1;{port};{port};")
}

// ============================================================================
// Upstream dialing
// ============================================================================

/// Dial an upstream Bedrock server: offline handshake, connected
/// handshake, then a [`RaknetStream`] ready for the login prelude.
///
/// # Errors
///
/// `DialFailed`-shaped `Io` errors, or `HandshakeTimeout` when the
/// exchange exceeds `timeout`.
pub async fn connect(addr: SocketAddr, timeout: Duration) -> Result<RaknetStream, ConnectionError> {
    tokio::time::timeout(timeout, do_connect(addr))
        .await
        .map_err(|_| ConnectionError::HandshakeTimeout {
            timeout_ms: timeout.as_millis() as u64,
        })?
}

async fn do_connect(addr: SocketAddr) -> Result<RaknetStream, ConnectionError> {
    let bind = if addr.is_ipv4() {
        SocketAddr::new(std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED), 0)
    } else {
        SocketAddr::new(std::net::IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED), 0)
    };
    let socket = Arc::new(UdpSocket::bind(bind).await?);
    socket.connect(addr).await?;
    let client_guid: u64 = rand::random();

    let mut buf = vec![0u8; usize::from(MAX_MTU) + 64];

    // Open connection 1: retry with a short per-attempt wait.
    let mut mtu = DEFAULT_MTU;
    let mut reply1 = None;
    for _ in 0..4 {
        let request = OpenConnectionRequest1 {
            protocol: RAKNET_PROTOCOL_VERSION,
            mtu,
        };
        socket.send(&request.encode()).await?;
        match tokio::time::timeout(Duration::from_millis(750), socket.recv(&mut buf)).await {
            Ok(Ok(len)) => {
                if let Ok(reply) = OpenConnectionReply1::decode(&buf[..len]) {
                    reply1 = Some(reply);
                    break;
                }
            }
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => continue,
        }
    }
    let reply1 = reply1.ok_or_else(|| {
        ConnectionError::Io(io::Error::new(
            io::ErrorKind::TimedOut,
            "no open connection reply",
        ))
    })?;
    mtu = reply1.mtu.min(MAX_MTU);

    // Open connection 2.
    let request2 = OpenConnectionRequest2 {
        server_address: addr,
        mtu,
        client_guid,
    };
    let reply2 = loop {
        socket.send(&request2.encode()).await?;
        match tokio::time::timeout(Duration::from_millis(750), socket.recv(&mut buf)).await {
            Ok(Ok(len)) => {
                if let Ok(reply) = OpenConnectionReply2::decode(&buf[..len]) {
                    break reply;
                }
            }
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => continue,
        }
    };

    // Connected handshake runs inside the session task.
    let (raw_tx, raw_rx) = mpsc::channel(RAW_QUEUE);
    let (app_tx, app_rx) = mpsc::channel(APP_QUEUE);
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (connected_tx, connected_rx) = oneshot::channel();

    let core = SessionCore {
        role: Role::Client,
        outlet: Outlet::Connected(socket.clone()),
        peer: addr,
        mtu: reply2.mtu.min(MAX_MTU),
        guid: client_guid,
        send_sequence: 0,
        reliable_index: 0,
        order_index: 0,
        split_id: 0,
        splits: HashMap::new(),
        app_tx,
        connected_tx: Some(connected_tx),
    };

    let recv_socket = socket.clone();
    let recv_task = tokio::spawn(async move {
        let mut buf = vec![0u8; usize::from(MAX_MTU) + 64];
        loop {
            match recv_socket.recv(&mut buf).await {
                Ok(len) => {
                    if raw_tx.send(Bytes::copy_from_slice(&buf[..len])).await.is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });
    tokio::spawn(async move {
        run_session(core, raw_rx, out_rx).await;
        recv_task.abort();
    });

    connected_rx.await.map_err(|_| {
        ConnectionError::Io(io::Error::new(
            io::ErrorKind::ConnectionAborted,
            "raknet session ended during handshake",
        ))
    })?;

    Ok(RaknetStream {
        peer: addr,
        incoming: app_rx,
        pending: Bytes::new(),
        outgoing: out_tx,
    })
}

/// Build a detached stream around raw channel ends.
#[cfg(test)]
pub(crate) fn test_stream(
    peer: SocketAddr,
    incoming: mpsc::Receiver<Bytes>,
    outgoing: mpsc::UnboundedSender<Bytes>,
) -> RaknetStream {
    RaknetStream {
        peer,
        incoming,
        pending: Bytes::new(),
        outgoing,
    }
}
