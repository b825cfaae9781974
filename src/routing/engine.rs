//! Hot-swappable route snapshot
//!
//! The active route table lives behind an `ArcSwap` so the match path
//! is a lock-free load. A connection loads the snapshot once when
//! matching begins and keeps that `Arc` for its whole lifetime; a
//! concurrent reload publishes a new snapshot without disturbing it.
//!
//! ```text
//! Connection -> RouteEngine::snapshot() -> ArcSwap::load_full() -> RouteSnapshot
//!                                               |
//!                                        (lock-free read)
//!
//! Hot reload -> RouteEngine::publish() -> ArcSwap::store() -> old snapshot
//!                                               |             dropped when its
//!                                         (atomic swap)       connections end
//! ```

use std::sync::Arc;

use arc_swap::ArcSwap;
use tracing::warn;

use super::ServerRoute;

/// An immutable, versioned compilation of the route list.
#[derive(Debug)]
pub struct RouteSnapshot {
    routes: Vec<Arc<ServerRoute>>,
    version: u64,
}

impl RouteSnapshot {
    /// Compile a route list into a snapshot.
    ///
    /// Domain patterns are lowercased; duplicate patterns across routes
    /// are kept (first-in-list wins at match time) but reported, since
    /// the shadowed route can never match through that pattern.
    #[must_use]
    pub fn compile(routes: Vec<ServerRoute>, version: u64) -> Self {
        let mut seen: Vec<(&str, &str)> = Vec::new();
        for route in &routes {
            for pattern in &route.domains {
                if let Some((_, first)) = seen
                    .iter()
                    .find(|(p, _)| p.eq_ignore_ascii_case(pattern))
                {
                    warn!(
                        pattern = %pattern,
                        first_route = %first,
                        shadowed_route = %route.id,
                        "duplicate domain pattern, first route in list order wins"
                    );
                } else {
                    seen.push((pattern.as_str(), route.id.as_str()));
                }
            }
        }

        let routes = routes
            .into_iter()
            .map(|mut r| {
                for d in &mut r.domains {
                    *d = d.to_ascii_lowercase();
                }
                Arc::new(r)
            })
            .collect();
        Self { routes, version }
    }

    /// Empty snapshot, version zero.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            routes: Vec::new(),
            version: 0,
        }
    }

    /// Snapshot version, monotonic across reloads.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Number of routes in this snapshot.
    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// All routes, in match order.
    #[must_use]
    pub fn routes(&self) -> &[Arc<ServerRoute>] {
        &self.routes
    }

    /// First route serving `gate_id` whose patterns match `host`.
    ///
    /// `host` must already be sanitized (lowercased, no FML suffix);
    /// the match itself is then a pure ordered scan.
    #[must_use]
    pub fn match_host(&self, gate_id: &str, host: &str) -> Option<Arc<ServerRoute>> {
        self.routes
            .iter()
            .find(|r| r.serves_gate(gate_id) && r.matches_host(host))
            .cloned()
    }
}

/// The published route table for one proxy.
pub struct RouteEngine {
    current: ArcSwap<RouteSnapshot>,
}

impl RouteEngine {
    /// Create an engine with an initial snapshot.
    #[must_use]
    pub fn new(initial: RouteSnapshot) -> Self {
        Self {
            current: ArcSwap::from_pointee(initial),
        }
    }

    /// Load the current snapshot. The returned `Arc` stays valid across
    /// concurrent publishes; a connection holds it for its lifetime.
    #[must_use]
    pub fn snapshot(&self) -> Arc<RouteSnapshot> {
        self.current.load_full()
    }

    /// Atomically publish a new snapshot. In-flight connections keep
    /// whatever snapshot they already loaded.
    pub fn publish(&self, snapshot: RouteSnapshot) {
        self.current.store(Arc::new(snapshot));
    }
}

impl Default for RouteEngine {
    fn default() -> Self {
        Self::new(RouteSnapshot::empty())
    }
}
