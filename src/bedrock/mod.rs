//! Bedrock edition support
//!
//! UDP transport with RakNet framing. [`raknet`] is the pure wire
//! codec, [`session`] demultiplexes datagrams into per-peer sessions
//! behind an `AsyncRead + AsyncWrite` virtual stream, [`login`] parses
//! the JWT-chain login, and [`processor`] ties them together per
//! connection.

pub mod login;
pub mod processor;
pub mod raknet;
pub mod session;

pub use session::{NewSession, RaknetListener, RaknetStream};
