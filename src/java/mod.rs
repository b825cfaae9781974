//! Java edition support
//!
//! TCP transport with VarInt-framed packets. [`codec`] is the framing
//! layer, [`packets`] the typed handshake/login/status packets, and
//! [`processor`] the per-connection handshake reader.

pub mod codec;
pub mod packets;
pub mod processor;
