//! Per-proxy connection statistics
//!
//! Counters are atomic and aggregated per proxy; each connection task
//! records its outcome once on completion.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Atomic counters for one proxy.
#[derive(Debug, Default)]
pub struct ProxyStats {
    accepted: AtomicU64,
    active: AtomicU64,
    forwarded: AtomicU64,
    status_served: AtomicU64,
    handshake_failures: AtomicU64,
    no_route: AtomicU64,
    bytes_up: AtomicU64,
    bytes_down: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct StatsSnapshot {
    pub accepted: u64,
    pub active: u64,
    pub forwarded: u64,
    pub status_served: u64,
    pub handshake_failures: u64,
    pub no_route: u64,
    pub bytes_up: u64,
    pub bytes_down: u64,
}

impl ProxyStats {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
        self.active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_closed(&self, bytes_up: u64, bytes_down: u64) {
        self.active.fetch_sub(1, Ordering::Relaxed);
        self.bytes_up.fetch_add(bytes_up, Ordering::Relaxed);
        self.bytes_down.fetch_add(bytes_down, Ordering::Relaxed);
    }

    pub fn record_forwarded(&self) {
        self.forwarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_status_served(&self) {
        self.status_served.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_handshake_failure(&self) {
        self.handshake_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_no_route(&self) {
        self.no_route.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn active(&self) -> u64 {
        self.active.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            active: self.active.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            status_served: self.status_served.load(Ordering::Relaxed),
            handshake_failures: self.handshake_failures.load(Ordering::Relaxed),
            no_route: self.no_route.load(Ordering::Relaxed),
            bytes_up: self.bytes_up.load(Ordering::Relaxed),
            bytes_down: self.bytes_down.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_counters_balance() {
        let stats = ProxyStats::new();
        stats.record_accepted();
        stats.record_accepted();
        assert_eq!(stats.active(), 2);

        stats.record_closed(100, 200);
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.active, 1);
        assert_eq!(snapshot.accepted, 2);
        assert_eq!(snapshot.bytes_up, 100);
        assert_eq!(snapshot.bytes_down, 200);
    }
}
