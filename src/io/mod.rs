//! I/O utilities
//!
//! The splice pump that carries opaque game traffic between client and
//! upstream after login.

mod copy;

pub use copy::{splice, PumpResult, DEFAULT_PUMP_BUFFER_SIZE};
