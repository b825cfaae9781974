//! Plugin host
//!
//! Plugins extend the proxy through a four-method lifecycle:
//! `load` (parse configuration), `enable` (receive the [`PluginApi`]
//! capability and register subscriptions), `disable`, and `reload`
//! (new configuration while running).
//!
//! The [`PluginApi`] is the only handle a plugin gets: event-bus
//! access plus read-only queries against the proxy set. Proxies hold
//! no reference back to plugins, so ownership stays one-way.
//!
//! Failure policy: a load or enable failure at startup is fatal; a
//! reload failure is logged and the plugin keeps its prior state.

pub mod traffic_limiter;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info};

use crate::config::Config;
use crate::error::PluginError;
use crate::event::EventBus;
use crate::proxy::{ProxySet, StatsSnapshot};
use crate::routing::RouteSnapshot;
use crate::Edition;

/// Capability handle granted to enabled plugins.
#[derive(Clone)]
pub struct PluginApi {
    bus: EventBus,
    proxies: Arc<ProxySet>,
}

impl PluginApi {
    #[must_use]
    pub fn new(bus: EventBus, proxies: Arc<ProxySet>) -> Self {
        Self { bus, proxies }
    }

    /// The event bus, for subscriptions and (rarely) publishing.
    #[must_use]
    pub fn events(&self) -> &EventBus {
        &self.bus
    }

    /// Counters for one edition's proxy.
    #[must_use]
    pub fn proxy_stats(&self, edition: Edition) -> StatsSnapshot {
        self.proxies.get(edition).stats()
    }

    /// The route table currently served for one edition.
    #[must_use]
    pub fn route_snapshot(&self, edition: Edition) -> Arc<RouteSnapshot> {
        self.proxies.get(edition).route_snapshot()
    }
}

/// The plugin contract.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Stable name; also the key of the plugin's config section.
    fn name(&self) -> &'static str;

    /// Parse configuration. Called before `enable` and never again.
    async fn load(&mut self, config: Option<&serde_yaml::Value>) -> Result<(), PluginError>;

    /// Take the capability handle and register subscriptions.
    async fn enable(&mut self, api: PluginApi) -> Result<(), PluginError>;

    /// Drop subscriptions and release resources.
    async fn disable(&mut self);

    /// Adopt new configuration while enabled.
    async fn reload(&mut self, config: Option<&serde_yaml::Value>) -> Result<(), PluginError>;
}

/// Owns the plugin instances and drives their lifecycle.
pub struct PluginManager {
    plugins: Vec<Box<dyn Plugin>>,
    api: PluginApi,
}

impl PluginManager {
    /// The built-in plugin set.
    #[must_use]
    pub fn with_builtin(api: PluginApi) -> Self {
        Self {
            plugins: vec![Box::new(traffic_limiter::TrafficLimiter::new())],
            api,
        }
    }

    #[must_use]
    pub fn new(api: PluginApi, plugins: Vec<Box<dyn Plugin>>) -> Self {
        Self { plugins, api }
    }

    /// Load every plugin from its config section. The first failure is
    /// fatal for startup.
    ///
    /// # Errors
    ///
    /// The failing plugin's [`PluginError`].
    pub async fn load_all(&mut self, config: &Config) -> Result<(), PluginError> {
        for plugin in &mut self.plugins {
            let section = config.plugin_section(plugin.name());
            plugin.load(section).await?;
            info!(plugin = plugin.name(), "plugin loaded");
        }
        Ok(())
    }

    /// Enable every loaded plugin.
    ///
    /// # Errors
    ///
    /// The failing plugin's [`PluginError`].
    pub async fn enable_all(&mut self) -> Result<(), PluginError> {
        for plugin in &mut self.plugins {
            plugin.enable(self.api.clone()).await?;
            info!(plugin = plugin.name(), "plugin enabled");
        }
        Ok(())
    }

    /// Disable every plugin, in reverse enable order.
    pub async fn disable_all(&mut self) {
        for plugin in self.plugins.iter_mut().rev() {
            plugin.disable().await;
            info!(plugin = plugin.name(), "plugin disabled");
        }
    }

    /// Reload every plugin with its new config section. A failing
    /// plugin logs and keeps its prior state; the rest still reload.
    pub async fn reload_all(&mut self, config: &Config) {
        for plugin in &mut self.plugins {
            let section = config.plugin_section(plugin.name());
            if let Err(e) = plugin.reload(section).await {
                error!(plugin = plugin.name(), error = %e, "plugin reload failed, keeping prior state");
            }
        }
    }
}
