//! Configuration types
//!
//! The configuration document is YAML with top-level `java`, `bedrock`,
//! `defaults`, and `plugins` keys. Each edition section declares
//! listeners, gateways (named groupings of listeners and servers), and
//! servers (routes). `defaults` supplies fallback timeouts and canned
//! responses; `plugins` holds one opaque section per plugin, handed to
//! that plugin verbatim.
//!
//! Raw entries are resolved into the runtime types
//! ([`ListenerBinding`], [`crate::routing::ServerRoute`]) by
//! [`Config::resolve`], which also derives gateway membership.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::java::packets::StatusJson;
use crate::routing::{MatchAction, ServerRoute};
use crate::Edition;

/// Gateway name used when a section declares no gateways.
pub const IMPLICIT_GATE_ID: &str = "default";

/// Root configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub java: EditionSection,
    #[serde(default)]
    pub bedrock: EditionSection,
    #[serde(default)]
    pub defaults: DefaultsSection,
    /// Per-plugin configuration, keyed by plugin name.
    #[serde(default)]
    pub plugins: HashMap<String, serde_yaml::Value>,
}

/// One edition's listeners, gateways, and servers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EditionSection {
    #[serde(default)]
    pub listeners: Vec<ListenerEntry>,
    /// Gateway name -> member listener/server ids. When empty, an
    /// implicit gateway holds every listener and server of the section.
    #[serde(default)]
    pub gateways: HashMap<String, GatewayEntry>,
    #[serde(default)]
    pub servers: Vec<ServerEntry>,
}

/// A raw listener declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerEntry {
    pub id: String,
    pub bind: SocketAddr,
    #[serde(default)]
    pub receive_proxy_protocol: bool,
    /// Peers allowed to send a PROXY header. Ignored unless
    /// `receive_proxy_protocol` is set.
    #[serde(default)]
    pub trusted_proxy_cidrs: Vec<IpNet>,
    /// Handshake deadline override in milliseconds.
    #[serde(default)]
    pub client_timeout_ms: Option<u64>,
    /// Bedrock only: MOTD served in unconnected pong replies.
    #[serde(default)]
    pub motd: Option<String>,
}

/// A raw gateway declaration: which listeners it owns and which
/// servers it exposes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayEntry {
    #[serde(default)]
    pub listeners: Vec<String>,
    #[serde(default)]
    pub servers: Vec<String>,
}

/// A raw server (route) declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerEntry {
    pub id: String,
    pub domains: Vec<String>,
    #[serde(default)]
    pub addresses: Vec<String>,
    #[serde(default)]
    pub dial_timeout_ms: Option<u64>,
    #[serde(default)]
    pub idle_timeout_ms: Option<u64>,
    #[serde(default)]
    pub send_proxy_protocol: bool,
    #[serde(default)]
    pub real_ip_header: bool,
    #[serde(default)]
    pub on_match_action: MatchAction,
    #[serde(default)]
    pub offline_status: Option<StatusJson>,
    #[serde(default)]
    pub disconnect_message: Option<String>,
}

/// Fallbacks applied where listeners and servers leave fields unset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsSection {
    #[serde(default = "default_client_timeout_ms")]
    pub client_timeout_ms: u64,
    #[serde(default = "default_dial_timeout_ms")]
    pub dial_timeout_ms: u64,
    /// Zero disables the pump idle timeout.
    #[serde(default)]
    pub idle_timeout_ms: u64,
    /// Grace period for in-flight connections on shutdown.
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
    #[serde(default = "default_disconnect_message")]
    pub disconnect_message: String,
    /// Status payload served when no route matches; absent means
    /// unmatched connections are closed silently.
    #[serde(default)]
    pub offline_status: Option<StatusJson>,
}

impl Default for DefaultsSection {
    fn default() -> Self {
        Self {
            client_timeout_ms: default_client_timeout_ms(),
            dial_timeout_ms: default_dial_timeout_ms(),
            idle_timeout_ms: 0,
            drain_timeout_ms: default_drain_timeout_ms(),
            disconnect_message: default_disconnect_message(),
            offline_status: None,
        }
    }
}

fn default_client_timeout_ms() -> u64 {
    10_000
}

fn default_dial_timeout_ms() -> u64 {
    5_000
}

fn default_drain_timeout_ms() -> u64 {
    10_000
}

fn default_disconnect_message() -> String {
    "No server is available to handle your connection.".into()
}

/// A listener resolved against its gateway and the defaults.
#[derive(Debug, Clone)]
pub struct ListenerBinding {
    pub id: String,
    pub bind: SocketAddr,
    pub gate_id: String,
    pub receive_proxy_protocol: bool,
    pub trusted_proxy_cidrs: Vec<IpNet>,
    pub client_timeout: Duration,
    pub motd: String,
}

impl ListenerBinding {
    /// Whether a PROXY header must be consumed from this peer.
    #[must_use]
    pub fn trusts_proxy_peer(&self, peer: std::net::IpAddr) -> bool {
        self.receive_proxy_protocol
            && self.trusted_proxy_cidrs.iter().any(|net| net.contains(&peer))
    }
}

/// One edition's resolved runtime view.
#[derive(Debug, Clone)]
pub struct ResolvedEdition {
    pub listeners: Vec<ListenerBinding>,
    pub routes: Vec<ServerRoute>,
}

impl Config {
    /// Validate the whole document.
    ///
    /// # Errors
    ///
    /// `ValidationError` naming the offending entry.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.java.validate("java")?;
        self.bedrock.validate("bedrock")?;
        Ok(())
    }

    /// Resolve one edition section against the defaults.
    ///
    /// # Errors
    ///
    /// `ValidationError` when gateway references are inconsistent.
    pub fn resolve(&self, edition: Edition) -> Result<ResolvedEdition, ConfigError> {
        let section = match edition {
            Edition::Java => &self.java,
            Edition::Bedrock => &self.bedrock,
        };
        section.resolve(&self.defaults)
    }

    /// Drain grace period on shutdown.
    #[must_use]
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.defaults.drain_timeout_ms)
    }

    /// A plugin's configuration section, if present.
    #[must_use]
    pub fn plugin_section(&self, name: &str) -> Option<&serde_yaml::Value> {
        self.plugins.get(name)
    }
}

impl EditionSection {
    fn validate(&self, section: &str) -> Result<(), ConfigError> {
        let mut listener_ids = std::collections::HashSet::new();
        for l in &self.listeners {
            if !listener_ids.insert(l.id.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "{section}: duplicate listener id '{}'",
                    l.id
                )));
            }
        }
        let mut server_ids = std::collections::HashSet::new();
        for s in &self.servers {
            if !server_ids.insert(s.id.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "{section}: duplicate server id '{}'",
                    s.id
                )));
            }
            if s.domains.is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "{section}: server '{}' has no domains",
                    s.id
                )));
            }
            if s.on_match_action == MatchAction::Forward && s.addresses.is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "{section}: server '{}' forwards but has no addresses",
                    s.id
                )));
            }
        }

        // Gateway references must exist, and a listener belongs to at
        // most one gateway (its gate id).
        let mut owned: HashMap<&str, &str> = HashMap::new();
        for (gate_id, gw) in &self.gateways {
            for lid in &gw.listeners {
                if !listener_ids.contains(lid.as_str()) {
                    return Err(ConfigError::ValidationError(format!(
                        "{section}: gateway '{gate_id}' references unknown listener '{lid}'"
                    )));
                }
                if let Some(other) = owned.insert(lid.as_str(), gate_id.as_str()) {
                    return Err(ConfigError::ValidationError(format!(
                        "{section}: listener '{lid}' is claimed by gateways '{other}' and '{gate_id}'"
                    )));
                }
            }
            for sid in &gw.servers {
                if !server_ids.contains(sid.as_str()) {
                    return Err(ConfigError::ValidationError(format!(
                        "{section}: gateway '{gate_id}' references unknown server '{sid}'"
                    )));
                }
            }
        }
        Ok(())
    }

    fn resolve(&self, defaults: &DefaultsSection) -> Result<ResolvedEdition, ConfigError> {
        // Listener id -> gate id. With no gateways declared, everything
        // lives on the implicit gateway.
        let mut listener_gate: HashMap<&str, &str> = HashMap::new();
        let mut server_gates: HashMap<&str, Vec<String>> = HashMap::new();
        if self.gateways.is_empty() {
            for l in &self.listeners {
                listener_gate.insert(l.id.as_str(), IMPLICIT_GATE_ID);
            }
        } else {
            for (gate_id, gw) in &self.gateways {
                for lid in &gw.listeners {
                    listener_gate.insert(lid.as_str(), gate_id.as_str());
                }
                for sid in &gw.servers {
                    server_gates
                        .entry(sid.as_str())
                        .or_default()
                        .push(gate_id.clone());
                }
            }
        }

        let mut listeners = Vec::with_capacity(self.listeners.len());
        for l in &self.listeners {
            let gate_id = listener_gate.get(l.id.as_str()).ok_or_else(|| {
                ConfigError::ValidationError(format!(
                    "listener '{}' is not a member of any gateway",
                    l.id
                ))
            })?;
            listeners.push(ListenerBinding {
                id: l.id.clone(),
                bind: l.bind,
                gate_id: (*gate_id).to_string(),
                receive_proxy_protocol: l.receive_proxy_protocol,
                trusted_proxy_cidrs: l.trusted_proxy_cidrs.clone(),
                client_timeout: Duration::from_millis(
                    l.client_timeout_ms.unwrap_or(defaults.client_timeout_ms),
                ),
                motd: l.motd.clone().unwrap_or_else(|| "craft-router".into()),
            });
        }

        let routes = self
            .servers
            .iter()
            .map(|s| ServerRoute {
                id: s.id.clone(),
                domains: s.domains.clone(),
                addresses: s.addresses.clone(),
                // Unreferenced servers serve every gateway.
                gate_ids: server_gates.get(s.id.as_str()).cloned().unwrap_or_default(),
                dial_timeout: Duration::from_millis(
                    s.dial_timeout_ms.unwrap_or(defaults.dial_timeout_ms),
                ),
                idle_timeout: Duration::from_millis(
                    s.idle_timeout_ms.unwrap_or(defaults.idle_timeout_ms),
                ),
                send_proxy_protocol: s.send_proxy_protocol,
                real_ip_header: s.real_ip_header,
                on_match_action: s.on_match_action,
                offline_status: s
                    .offline_status
                    .clone()
                    .or_else(|| defaults.offline_status.clone()),
                disconnect_message: s
                    .disconnect_message
                    .clone()
                    .unwrap_or_else(|| defaults.disconnect_message.clone()),
            })
            .collect();

        Ok(ResolvedEdition { listeners, routes })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_yaml() -> &'static str {
        r#"
java:
  listeners:
    - id: main
      bind: 127.0.0.1:25565
  servers:
    - id: lobby
      domains: ["*"]
      addresses: ["127.0.0.1:25566"]
"#
    }

    #[test]
    fn minimal_config_parses_and_resolves() {
        let cfg: Config = serde_yaml::from_str(minimal_yaml()).unwrap();
        cfg.validate().unwrap();
        let resolved = cfg.resolve(Edition::Java).unwrap();
        assert_eq!(resolved.listeners.len(), 1);
        assert_eq!(resolved.listeners[0].gate_id, IMPLICIT_GATE_ID);
        assert_eq!(resolved.routes.len(), 1);
        assert!(resolved.routes[0].gate_ids.is_empty());
        assert_eq!(
            resolved.routes[0].dial_timeout,
            Duration::from_millis(default_dial_timeout_ms())
        );
    }

    #[test]
    fn gateways_assign_membership() {
        let yaml = r#"
java:
  listeners:
    - id: external
      bind: 0.0.0.0:25565
    - id: internal
      bind: 127.0.0.1:25570
  gateways:
    public:
      listeners: [external]
      servers: [lobby]
    staff:
      listeners: [internal]
      servers: [lobby, admin]
  servers:
    - id: lobby
      domains: ["*"]
      addresses: ["127.0.0.1:25566"]
    - id: admin
      domains: ["admin.example.com"]
      addresses: ["127.0.0.1:25567"]
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        cfg.validate().unwrap();
        let resolved = cfg.resolve(Edition::Java).unwrap();

        let external = resolved
            .listeners
            .iter()
            .find(|l| l.id == "external")
            .unwrap();
        assert_eq!(external.gate_id, "public");

        let admin = resolved.routes.iter().find(|r| r.id == "admin").unwrap();
        assert_eq!(admin.gate_ids, vec!["staff".to_string()]);

        let lobby = resolved.routes.iter().find(|r| r.id == "lobby").unwrap();
        let mut gates = lobby.gate_ids.clone();
        gates.sort();
        assert_eq!(gates, vec!["public".to_string(), "staff".to_string()]);
    }

    #[test]
    fn listener_claimed_twice_is_rejected() {
        let yaml = r#"
java:
  listeners:
    - id: main
      bind: 127.0.0.1:25565
  gateways:
    a: { listeners: [main] }
    b: { listeners: [main] }
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn forward_without_addresses_is_rejected() {
        let yaml = r#"
java:
  servers:
    - id: broken
      domains: ["*"]
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn trusted_cidrs_gate_proxy_protocol() {
        let yaml = r#"
java:
  listeners:
    - id: main
      bind: 127.0.0.1:25565
      receive_proxy_protocol: true
      trusted_proxy_cidrs: ["10.0.0.0/8"]
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        let resolved = cfg.resolve(Edition::Java).unwrap();
        let l = &resolved.listeners[0];
        assert!(l.trusts_proxy_peer("10.1.2.3".parse().unwrap()));
        assert!(!l.trusts_proxy_peer("192.168.1.1".parse().unwrap()));
    }
}
