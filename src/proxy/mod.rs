//! Proxy assembly and supervision
//!
//! One [`Proxy`] exists per edition; the [`ProxySet`] supervisor owns
//! both, applies configuration, serialises hot reloads, and drives the
//! drain on shutdown.
//!
//! Hot reload discipline: the new configuration is resolved entirely
//! before anything is touched; a resolution failure aborts the reload
//! and keeps the prior state. Applying the new state publishes the
//! route snapshot atomically and diffs listeners by bind address:
//! unchanged binds keep their socket and only adopt new timeouts, so
//! in-flight connections never notice a reload.

pub mod conn;
pub mod dialer;
pub mod gate;
pub mod handler;
pub mod stats;

pub use conn::{EditionStream, ProcessedConn};
pub use handler::Fallback;
pub use stats::{ProxyStats, StatsSnapshot};

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::config::{Config, ResolvedEdition};
use crate::error::{ConnectionError, RouterError};
use crate::event::{Event, EventBus};
use crate::routing::{RouteEngine, RouteSnapshot};
use crate::Edition;

use gate::Gate;

/// State shared between a proxy's gates and connection tasks.
pub struct ProxyShared {
    pub(crate) edition: Edition,
    pub(crate) engine: RouteEngine,
    pub(crate) bus: EventBus,
    pub(crate) stats: Arc<ProxyStats>,
    pub(crate) fallback: ArcSwap<Fallback>,
    pub(crate) shutdown: broadcast::Sender<()>,
}

/// One edition's proxy: its listeners, route table, and counters.
pub struct Proxy {
    shared: Arc<ProxyShared>,
    gates: Mutex<HashMap<SocketAddr, Gate>>,
    version: AtomicU64,
}

impl Proxy {
    /// Create an idle proxy with an empty route table.
    #[must_use]
    pub fn new(edition: Edition, bus: EventBus) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            shared: Arc::new(ProxyShared {
                edition,
                engine: RouteEngine::default(),
                bus,
                stats: Arc::new(ProxyStats::new()),
                fallback: ArcSwap::from_pointee(Fallback::default()),
                shutdown,
            }),
            gates: Mutex::new(HashMap::new()),
            version: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn edition(&self) -> Edition {
        self.shared.edition
    }

    /// Apply a resolved configuration: publish the new route snapshot,
    /// then reconcile listeners against the wanted set.
    ///
    /// # Errors
    ///
    /// `BindFailed` when a newly wanted listener cannot be bound;
    /// already-open listeners stay up in that case.
    pub async fn apply(
        &self,
        resolved: ResolvedEdition,
        fallback: Fallback,
    ) -> Result<(), ConnectionError> {
        let version = self.version.fetch_add(1, Ordering::Relaxed) + 1;
        self.shared
            .engine
            .publish(RouteSnapshot::compile(resolved.routes, version));
        self.shared.fallback.store(Arc::new(fallback));

        // Diff listeners by bind address: keep matching binds (adopt
        // new settings live), open new ones, close removed ones last.
        let wanted: HashMap<SocketAddr, _> = resolved
            .listeners
            .into_iter()
            .map(|l| (l.bind, l))
            .collect();

        let existing: Vec<SocketAddr> = self.gates.lock().keys().copied().collect();
        for (bind, binding) in &wanted {
            if existing.contains(bind) {
                if let Some(gate) = self.gates.lock().get(bind) {
                    gate.update(binding.clone());
                }
            } else {
                let gate = Gate::open(binding.clone(), self.shared.clone()).await?;
                self.gates.lock().insert(*bind, gate);
            }
        }
        let stale: Vec<SocketAddr> = existing
            .into_iter()
            .filter(|bind| !wanted.contains_key(bind))
            .collect();
        for bind in stale {
            if let Some(gate) = self.gates.lock().remove(&bind) {
                gate.close();
            }
        }

        info!(
            edition = ?self.shared.edition,
            version,
            listeners = self.gates.lock().len(),
            "configuration applied"
        );
        Ok(())
    }

    /// Stop accepting and signal all connection tasks to wind down.
    pub fn begin_shutdown(&self) {
        for (_, gate) in self.gates.lock().drain() {
            gate.close();
        }
        let _ = self.shared.shutdown.send(());
    }

    /// Bound addresses of the open gates (test and admin surface).
    #[must_use]
    pub fn listener_addrs(&self) -> Vec<SocketAddr> {
        self.gates.lock().values().map(Gate::local_addr).collect()
    }

    /// Read-only view of the active route table.
    #[must_use]
    pub fn route_snapshot(&self) -> Arc<RouteSnapshot> {
        self.shared.engine.snapshot()
    }

    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    fn active_connections(&self) -> u64 {
        self.shared.stats.active()
    }
}

/// The supervisor owning one proxy per edition.
pub struct ProxySet {
    proxies: HashMap<Edition, Arc<Proxy>>,
    bus: EventBus,
    /// Serialises reloads; held only across a swap, never while a
    /// connection is being served.
    reload_mu: tokio::sync::Mutex<()>,
}

impl ProxySet {
    /// Build an idle proxy per edition.
    #[must_use]
    pub fn new(bus: EventBus) -> Self {
        let mut proxies = HashMap::new();
        for edition in [Edition::Java, Edition::Bedrock] {
            proxies.insert(edition, Arc::new(Proxy::new(edition, bus.clone())));
        }
        Self {
            proxies,
            bus,
            reload_mu: tokio::sync::Mutex::new(()),
        }
    }

    #[must_use]
    pub fn get(&self, edition: Edition) -> Arc<Proxy> {
        self.proxies[&edition].clone()
    }

    /// Iterate the proxies (read-only admin surface).
    pub fn proxies(&self) -> impl Iterator<Item = &Arc<Proxy>> {
        self.proxies.values()
    }

    /// Apply a full configuration document to both editions.
    ///
    /// Both edition sections are resolved up front; any failure aborts
    /// the whole application and leaves the prior configuration
    /// active. On success `ConfigReloaded` is broadcast.
    ///
    /// # Errors
    ///
    /// Resolution or bind errors; see [`Proxy::apply`].
    pub async fn apply_config(&self, config: &Config) -> Result<(), RouterError> {
        let _guard = self.reload_mu.lock().await;

        // Resolve everything before touching live state.
        let java = config.resolve(Edition::Java)?;
        let bedrock = config.resolve(Edition::Bedrock)?;
        let fallback = Fallback {
            offline_status: config.defaults.offline_status.clone(),
            disconnect_message: config.defaults.disconnect_message.clone(),
        };

        self.proxies[&Edition::Java]
            .apply(java, fallback.clone())
            .await?;
        self.proxies[&Edition::Bedrock]
            .apply(bedrock, fallback)
            .await?;

        let _ = self.bus.publish(&Event::ConfigReloaded {
            config: Arc::new(config.clone()),
        });
        Ok(())
    }

    /// Reload in place. A failure is logged and the prior
    /// configuration stays active.
    pub async fn reload(&self, config: &Config) {
        match self.apply_config(config).await {
            Ok(()) => info!("configuration reloaded"),
            Err(e) => error!(error = %e, "reload failed, keeping previous configuration"),
        }
    }

    /// Stop accepting everywhere, then wait up to `drain` for in-flight
    /// connections to finish before returning.
    pub async fn shutdown(&self, drain: Duration) {
        for proxy in self.proxies.values() {
            proxy.begin_shutdown();
        }

        let deadline = tokio::time::Instant::now() + drain;
        loop {
            let active: u64 = self.proxies.values().map(|p| p.active_connections()).sum();
            if active == 0 {
                info!("all connections drained");
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(active, "drain period elapsed, forcing shutdown");
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}
