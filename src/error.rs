//! Error types for craft-router
//!
//! This module defines the error hierarchy for the proxy. All errors are
//! categorized by subsystem; protocol errors additionally carry a parse
//! classification so callers can distinguish "feed me more bytes" from
//! "give up on this connection".

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Top-level error type for craft-router
#[derive(Debug, Error)]
pub enum RouterError {
    /// Configuration errors (file parsing, validation)
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Wire protocol errors (framing, unmarshalling)
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Connection handling errors
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// Route matching errors
    #[error("Route error: {0}")]
    Route(#[from] RouteError),

    /// Plugin lifecycle errors
    #[error("Plugin error: {0}")]
    Plugin(#[from] PluginError),

    /// I/O errors not covered by other categories
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File not found or inaccessible
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// YAML parsing error
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Semantic validation error
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    /// Failed to materialise the default configuration
    #[error("Failed to write default configuration to {path}: {reason}")]
    SeedError { path: String, reason: String },

    /// Config watcher error
    #[error("Configuration watcher error: {0}")]
    WatchError(String),

    /// I/O while reading the config file
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Wire protocol errors, classified by how the caller should react.
///
/// `ShortRead` means the frame was truncated and more bytes could complete
/// it; `Malformed` means the bytes can never form a valid frame;
/// `Unexpected` means a well-formed packet arrived that this stage does
/// not accept.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The buffer ended before the frame was complete
    #[error("Short read: need more bytes ({context})")]
    ShortRead { context: &'static str },

    /// The bytes can never form a valid frame
    #[error("Malformed packet: {0}")]
    Malformed(String),

    /// A valid packet with an ID this stage does not accept
    #[error("Unexpected packet id {id:#04x}, expected {expected}")]
    Unexpected { id: i32, expected: &'static str },

    /// Frame length exceeds the protocol bound
    #[error("Packet length {length} exceeds maximum {max}")]
    PacketTooLarge { length: usize, max: usize },

    /// Underlying transport error while satisfying a frame
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ProtocolError {
    /// Shorthand for a malformed-packet error
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::Malformed(msg.into())
    }

    /// Whether retrying the read with more bytes could succeed
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ShortRead { .. })
    }
}

/// Connection handling errors
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Failed to bind a listener
    #[error("Failed to bind to {addr}: {reason}")]
    BindFailed { addr: SocketAddr, reason: String },

    /// The client did not complete its handshake within the deadline
    #[error("Handshake timed out after {timeout_ms}ms")]
    HandshakeTimeout { timeout_ms: u64 },

    /// PROXY protocol header could not be parsed from a trusted peer
    #[error("Invalid PROXY protocol header: {0}")]
    ProxyProtocol(String),

    /// All upstream addresses failed to connect
    #[error("Dial failed for route '{route_id}': {reason}")]
    DialFailed { route_id: String, reason: String },

    /// A blocking event subscriber vetoed the connection
    #[error("Connection vetoed: {message}")]
    Vetoed { message: String },

    /// The proxy is draining and no longer accepts connections
    #[error("Proxy is shutting down")]
    ShuttingDown,

    /// Protocol failure while processing the connection
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Transport failure
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Route matching errors
#[derive(Debug, Error)]
pub enum RouteError {
    /// No route matched the requested host
    #[error("No route matches host '{host}' on gate '{gate_id}'")]
    NoMatch { host: String, gate_id: String },

    /// A route references an unknown gateway
    #[error("Route '{route_id}' references unknown gateway '{gate_id}'")]
    UnknownGateway { route_id: String, gate_id: String },

    /// A route has no upstream addresses
    #[error("Route '{route_id}' has no addresses")]
    EmptyAddresses { route_id: String },
}

/// Plugin lifecycle errors
#[derive(Debug, Error)]
pub enum PluginError {
    /// Plugin failed to load its configuration
    #[error("Plugin '{name}' failed to load: {reason}")]
    LoadFailed { name: String, reason: String },

    /// Plugin failed to enable
    #[error("Plugin '{name}' failed to enable: {reason}")]
    EnableFailed { name: String, reason: String },

    /// Plugin failed to reload; it keeps its prior state
    #[error("Plugin '{name}' failed to reload: {reason}")]
    ReloadFailed { name: String, reason: String },
}
