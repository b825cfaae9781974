//! Traffic limiter plugin
//!
//! A blocking `PreConnConnecting` subscriber that vetoes clients
//! exceeding a per-IP token bucket. The veto message reaches the
//! client as its disconnect reason before any upstream is dialed.
//!
//! Each client IP gets an independent limiter in a `DashMap`;
//! configuration swaps atomically on reload, and buckets re-fill under
//! the new quota as they are next touched.

use std::net::IpAddr;
use std::num::NonZeroU32;
use std::sync::Arc;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use dashmap::DashMap;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use serde::Deserialize;
use tracing::{debug, info};

use super::{Plugin, PluginApi};
use crate::error::PluginError;
use crate::event::{Event, Veto};

const PLUGIN_NAME: &str = "traffic_limiter";

type ClientRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct LimiterConfig {
    enabled: bool,
    rate_per_second: u32,
    burst: u32,
    message: String,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            rate_per_second: 10,
            burst: 20,
            message: "You are connecting too often, slow down.".into(),
        }
    }
}

struct LimiterState {
    config: LimiterConfig,
    quota: Quota,
    clients: DashMap<IpAddr, ClientRateLimiter>,
}

impl LimiterState {
    /// An inert state for the window between construction and `load`.
    fn disabled() -> Self {
        Self {
            quota: Quota::per_second(NonZeroU32::MIN),
            config: LimiterConfig {
                enabled: false,
                ..LimiterConfig::default()
            },
            clients: DashMap::new(),
        }
    }

    fn new(config: LimiterConfig) -> Result<Self, PluginError> {
        let rate = NonZeroU32::new(config.rate_per_second).ok_or_else(|| {
            PluginError::LoadFailed {
                name: PLUGIN_NAME.into(),
                reason: "rate_per_second must be positive".into(),
            }
        })?;
        let burst = NonZeroU32::new(config.burst.max(1)).unwrap_or(rate);
        Ok(Self {
            quota: Quota::per_second(rate).allow_burst(burst),
            config,
            clients: DashMap::new(),
        })
    }

    /// Whether `client` may open another connection right now.
    fn check(&self, client: IpAddr) -> Result<(), Veto> {
        if !self.config.enabled {
            return Ok(());
        }
        let limiter = self
            .clients
            .entry(client)
            .or_insert_with(|| RateLimiter::direct(self.quota));
        if limiter.check().is_err() {
            debug!(client = %client, "connection rate limit exceeded");
            return Err(Veto::new(self.config.message.clone()));
        }
        Ok(())
    }
}

/// The built-in per-IP connection rate limiter.
pub struct TrafficLimiter {
    state: Arc<ArcSwap<LimiterState>>,
    bus: Option<crate::event::EventBus>,
}

impl TrafficLimiter {
    #[must_use]
    pub fn new() -> Self {
        Self {
            // Inert until load() sees configuration.
            state: Arc::new(ArcSwap::from_pointee(LimiterState::disabled())),
            bus: None,
        }
    }

    fn parse(config: Option<&serde_yaml::Value>) -> Result<LimiterConfig, PluginError> {
        match config {
            None => Ok(LimiterConfig::default()),
            Some(value) => serde_yaml::from_value(value.clone()).map_err(|e| {
                PluginError::LoadFailed {
                    name: PLUGIN_NAME.into(),
                    reason: e.to_string(),
                }
            }),
        }
    }
}

impl Default for TrafficLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Plugin for TrafficLimiter {
    fn name(&self) -> &'static str {
        PLUGIN_NAME
    }

    async fn load(&mut self, config: Option<&serde_yaml::Value>) -> Result<(), PluginError> {
        let config = Self::parse(config)?;
        self.state.store(Arc::new(LimiterState::new(config)?));
        Ok(())
    }

    async fn enable(&mut self, api: PluginApi) -> Result<(), PluginError> {
        let state = self.state.clone();
        api.events()
            .subscribe_blocking(PLUGIN_NAME, move |event| match event {
                Event::PreConnConnecting { conn, .. } => {
                    state.load().check(conn.remote_addr.ip())
                }
                _ => Ok(()),
            });
        self.bus = Some(api.events().clone());
        if self.state.load().config.enabled {
            info!(
                rate = self.state.load().config.rate_per_second,
                burst = self.state.load().config.burst,
                "traffic limiter active"
            );
        }
        Ok(())
    }

    async fn disable(&mut self) {
        if let Some(bus) = self.bus.take() {
            bus.unsubscribe(PLUGIN_NAME);
        }
    }

    async fn reload(&mut self, config: Option<&serde_yaml::Value>) -> Result<(), PluginError> {
        let config = Self::parse(config).map_err(|e| PluginError::ReloadFailed {
            name: PLUGIN_NAME.into(),
            reason: e.to_string(),
        })?;
        let state = LimiterState::new(config).map_err(|e| PluginError::ReloadFailed {
            name: PLUGIN_NAME.into(),
            reason: e.to_string(),
        })?;
        self.state.store(Arc::new(state));
        Ok(())
    }
}
