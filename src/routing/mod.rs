//! Host-based route table
//!
//! A route maps a set of domain patterns (plus gateway membership) to an
//! upstream target or a canned response. Matching is case-insensitive
//! and first-match-wins over the route list:
//!
//! ```text
//! requested host -> lowercase -> [gate filter] -> first route whose
//!                                 pattern list contains a match
//! ```
//!
//! Patterns are exact lowercase hosts or globs where `*` matches any
//! run of characters (`*.example.com` matches `mc.example.com`); the
//! literal pattern `*` is the catch-all.
//!
//! # Example
//!
//! ```
//! use craft_router::routing::pattern_matches;
//!
//! assert!(pattern_matches("play.example.com", "play.example.com"));
//! assert!(pattern_matches("*.example.com", "mc.example.com"));
//! assert!(pattern_matches("*", "anything.at.all"));
//! assert!(!pattern_matches("*.example.com", "example.org"));
//! ```

mod engine;

pub use engine::{RouteEngine, RouteSnapshot};

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::java::packets::StatusJson;

/// What to do when a route matches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchAction {
    /// Dial the upstream and splice.
    #[default]
    Forward,
    /// Serve the canned status payload (or a login disconnect) and close.
    Status,
    /// Send the disconnect message and close.
    Disconnect,
}

/// A single route from domain patterns to an upstream target.
#[derive(Debug, Clone)]
pub struct ServerRoute {
    /// Stable identifier, used in logs and config references.
    pub id: String,
    /// Domain patterns, tried in order.
    pub domains: Vec<String>,
    /// Upstream endpoints, dialed in order until one connects.
    pub addresses: Vec<String>,
    /// Gateways this route serves; empty means every gateway.
    pub gate_ids: Vec<String>,
    /// Per-address dial timeout.
    pub dial_timeout: Duration,
    /// Idle window for the splice pump; zero disables the idle timeout.
    pub idle_timeout: Duration,
    /// Prepend a PROXY v2 header to the upstream connection.
    pub send_proxy_protocol: bool,
    /// Rewrite the Java handshake address to carry the client IP.
    pub real_ip_header: bool,
    /// Action on match.
    pub on_match_action: MatchAction,
    /// Status document served for `Status` action and status pings.
    pub offline_status: Option<StatusJson>,
    /// Disconnect reason for `Disconnect` action, vetoes, and dial failure.
    pub disconnect_message: String,
}

impl ServerRoute {
    /// Whether this route serves the given gateway.
    #[must_use]
    pub fn serves_gate(&self, gate_id: &str) -> bool {
        self.gate_ids.is_empty() || self.gate_ids.iter().any(|g| g == gate_id)
    }

    /// Whether any of this route's patterns matches the (lowercased) host.
    #[must_use]
    pub fn matches_host(&self, host: &str) -> bool {
        self.domains.iter().any(|p| pattern_matches(p, host))
    }
}

/// Normalise a requested hostname for matching: anything after a NUL
/// separator (Forge/FML markers), surrounding whitespace, and trailing
/// dots are stripped, and the result is lowercased.
#[must_use]
pub fn sanitize_host(raw: &str) -> String {
    let primary = raw.split('\0').next().unwrap_or(raw);
    primary.trim().trim_end_matches('.').to_ascii_lowercase()
}

/// Match a single pattern against a lowercased host.
///
/// `*` in a pattern matches any run of characters; comparison is
/// case-insensitive on the pattern side (hosts are expected lowercased
/// already).
#[must_use]
pub fn pattern_matches(pattern: &str, host: &str) -> bool {
    glob_match(&pattern.to_ascii_lowercase(), host)
}

/// Iterative glob with `*` as the only wildcard.
fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ti));
            pi += 1;
        } else if let Some((sp, st)) = star {
            // Backtrack: let the star swallow one more character.
            pi = sp + 1;
            ti = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}
