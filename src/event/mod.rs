//! Connection-lifecycle events
//!
//! The proxy publishes a small set of events as a connection moves
//! through its pipeline. For a single connection the order is
//! monotonic:
//!
//! ```text
//! PreLogin < PreConnConnecting < PostLogin < PlayerJoin < PlayerLeave
//! ```
//!
//! No ordering is guaranteed between connections. Subscribers are
//! registered as either *blocking* (invoked inline on the connection
//! task, may veto `PreConnConnecting`) or *async* (fed through a
//! bounded queue that drops on overflow, never blocking the producer).

mod bus;

pub use bus::{EventBus, Veto, ASYNC_QUEUE_CAPACITY};

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::Edition;

/// Immutable view of a processed connection carried in events.
#[derive(Debug, Clone)]
pub struct ConnSnapshot {
    pub edition: Edition,
    /// Client address after any PROXY protocol rewrite.
    pub remote_addr: SocketAddr,
    /// Listener address the client connected to.
    pub local_addr: SocketAddr,
    pub gate_id: String,
    /// Sanitized requested host.
    pub requested_host: String,
    pub requested_port: u16,
    /// Known for Java login-state and Bedrock connections.
    pub username: Option<String>,
    pub protocol_version: i32,
}

/// Why a connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveReason {
    /// Served a status response and closed.
    Status,
    /// Either side closed the spliced connection.
    Disconnected,
    /// The pump's idle window elapsed.
    IdleTimeout,
    /// Every upstream address failed to connect.
    DialFailed,
    /// A blocking subscriber vetoed the connection.
    Vetoed,
    /// No route matched the requested host.
    NoRoute,
    /// The route was configured to disconnect.
    Rejected,
    /// An unexpected error ended the connection.
    Error,
}

impl LeaveReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Status => "status",
            Self::Disconnected => "disconnected",
            Self::IdleTimeout => "idle timeout",
            Self::DialFailed => "dial failed",
            Self::Vetoed => "vetoed",
            Self::NoRoute => "no route",
            Self::Rejected => "rejected",
            Self::Error => "error",
        }
    }
}

/// A connection-lifecycle or configuration event.
#[derive(Debug, Clone)]
pub enum Event {
    /// The handshake was parsed; nothing has been dialed yet.
    PreLogin { conn: ConnSnapshot },
    /// An upstream was chosen and is about to be dialed. Blocking
    /// subscribers may veto, turning the connection into a disconnect.
    PreConnConnecting {
        conn: ConnSnapshot,
        upstream_addr: String,
    },
    /// The upstream connection is established.
    PostLogin {
        conn: ConnSnapshot,
        upstream_addr: SocketAddr,
    },
    /// The prelude was replayed and the splice pump is starting.
    PlayerJoin {
        conn: ConnSnapshot,
        upstream_addr: SocketAddr,
    },
    /// The connection ended. Emitted exactly once per connection.
    PlayerLeave {
        conn: ConnSnapshot,
        reason: LeaveReason,
        duration: Duration,
        bytes_up: u64,
        bytes_down: u64,
    },
    /// A new configuration was applied.
    ConfigReloaded { config: Arc<Config> },
}

impl Event {
    /// Short topic name for logs and subscriber filtering.
    #[must_use]
    pub fn topic(&self) -> &'static str {
        match self {
            Self::PreLogin { .. } => "PreLogin",
            Self::PreConnConnecting { .. } => "PreConnConnecting",
            Self::PostLogin { .. } => "PostLogin",
            Self::PlayerJoin { .. } => "PlayerJoin",
            Self::PlayerLeave { .. } => "PlayerLeave",
            Self::ConfigReloaded { .. } => "ConfigReloaded",
        }
    }
}
