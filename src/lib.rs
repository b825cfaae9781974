//! craft-router: reverse proxy for Minecraft servers
//!
//! craft-router terminates incoming Minecraft connections, inspects
//! the opening handshake to learn which virtual host the player asked
//! for, picks an upstream server from a hot-reloadable route table,
//! and splices the two connections transparently. Both protocol
//! families are served: Java edition (TCP, VarInt-framed packets) and
//! Bedrock edition (UDP, RakNet).
//!
//! # Architecture
//!
//! ```text
//! Client -> Gate (listener) -> Processor -> Route match -> Dialer -> Upstream
//!                                  |             |            |
//!                            handshake      ArcSwap        PROXY v2 +
//!                            + prelude      snapshot       prelude replay
//!                                                              |
//!                                                              v
//!                                                        Splice pump
//! ```
//!
//! Connection-lifecycle events fan out on an in-process [`event`] bus;
//! [`plugin`]s subscribe (blocking subscribers may veto a connection
//! before its upstream is dialed). The [`proxy::ProxySet`] supervisor
//! applies configuration and hot reload: route tables swap atomically
//! and in-flight connections keep the table they matched against.
//!
//! # Modules
//!
//! - [`config`]: YAML configuration, validation, default seeding, watching
//! - [`error`]: error hierarchy
//! - [`event`]: lifecycle events and the pub/sub bus
//! - [`io`]: the bidirectional splice pump
//! - [`java`]: Java edition codec and connection processor
//! - [`bedrock`]: Bedrock edition RakNet codec, sessions, login parsing
//! - [`plugin`]: plugin contract, host, and the built-in traffic limiter
//! - [`proxy`]: gates, per-connection pipeline, supervisor
//! - [`proxy_protocol`]: HAProxy PROXY v1/v2 support
//! - [`routing`]: route table, host pattern matching, hot-swap engine

pub mod bedrock;
pub mod config;
pub mod error;
pub mod event;
pub mod io;
pub mod java;
pub mod plugin;
pub mod proxy;
pub mod proxy_protocol;
pub mod routing;

use serde::{Deserialize, Serialize};

/// Crate version, surfaced by the `version` subcommand.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// The Minecraft protocol family of a listener or connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Edition {
    /// TCP transport, VarInt-framed packets.
    Java,
    /// UDP transport, RakNet datagrams.
    Bedrock,
}

impl std::fmt::Display for Edition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Java => write!(f, "java"),
            Self::Bedrock => write!(f, "bedrock"),
        }
    }
}

// Commonly used types at the crate root.
pub use config::Config;
pub use error::RouterError;
pub use event::{Event, EventBus};
pub use proxy::{ProcessedConn, Proxy, ProxySet};
pub use routing::{RouteEngine, RouteSnapshot, ServerRoute};
