//! Per-connection pipeline
//!
//! Drives a processed connection from match to close:
//!
//! ```text
//! ProcessedConn -> route snapshot -> match -> action
//!    Forward:     PreConnConnecting (vetoable) -> dial -> PostLogin
//!                 -> prelude replay -> PlayerJoin -> splice pump
//!    Status:      canned status / disconnect, close
//!    Disconnect:  canned disconnect, close
//!    NoMatch:     default status if configured, else silent close
//! ```
//!
//! The route snapshot is loaded once by the caller and held for the
//! whole connection; a concurrent reload never changes the route
//! decisions of a connection already past its match. `PlayerLeave` is
//! emitted exactly once per connection, on every path.

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::conn::ProcessedConn;
use super::dialer;
use super::stats::ProxyStats;
use crate::event::{Event, EventBus, LeaveReason};
use crate::io::splice;
use crate::java::packets::StatusJson;
use crate::routing::{MatchAction, RouteSnapshot};

/// No-match fallback behaviour, from the `defaults` config section.
#[derive(Debug, Clone, Default)]
pub struct Fallback {
    /// Served to unmatched status probes; `None` closes silently.
    pub offline_status: Option<StatusJson>,
    pub disconnect_message: String,
}

struct Outcome {
    reason: LeaveReason,
    bytes_up: u64,
    bytes_down: u64,
}

impl Outcome {
    fn closed(reason: LeaveReason) -> Self {
        Self {
            reason,
            bytes_up: 0,
            bytes_down: 0,
        }
    }
}

/// Serve one processed connection to completion.
#[allow(clippy::too_many_arguments)]
pub async fn serve(
    mut conn: ProcessedConn,
    snapshot: Arc<RouteSnapshot>,
    fallback: Arc<Fallback>,
    bus: EventBus,
    stats: Arc<ProxyStats>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let started = Instant::now();
    let snap = conn.snapshot();
    let remote_addr = conn.remote_addr;

    // PreLogin is informational; a veto here is a subscriber bug.
    if let Err(veto) = bus.publish(&Event::PreLogin { conn: snap.clone() }) {
        warn!(message = %veto.message, "ignoring veto on PreLogin");
    }

    let outcome = tokio::select! {
        outcome = handle(&mut conn, &snapshot, &fallback, &bus, &stats) => outcome,
        _ = shutdown.recv() => {
            debug!(client = %remote_addr, "connection cancelled by shutdown");
            Outcome::closed(LeaveReason::Disconnected)
        }
    };

    stats.record_closed(outcome.bytes_up, outcome.bytes_down);
    let duration = started.elapsed();
    let _ = bus.publish(&Event::PlayerLeave {
        conn: snap,
        reason: outcome.reason,
        duration,
        bytes_up: outcome.bytes_up,
        bytes_down: outcome.bytes_down,
    });
}

async fn handle(
    conn: &mut ProcessedConn,
    snapshot: &RouteSnapshot,
    fallback: &Fallback,
    bus: &EventBus,
    stats: &ProxyStats,
) -> Outcome {
    let Some(route) = snapshot.match_host(&conn.gate_id, &conn.requested_host) else {
        stats.record_no_route();
        debug!(
            client = %conn.remote_addr,
            host = %conn.requested_host,
            gate = %conn.gate_id,
            "no matching route"
        );
        if let Some(status) = &fallback.offline_status {
            dialer::serve_status(conn, status, &fallback.disconnect_message).await;
        }
        return Outcome::closed(LeaveReason::NoRoute);
    };

    match route.on_match_action {
        MatchAction::Status => {
            stats.record_status_served();
            let status = route.offline_status.clone().unwrap_or_default();
            dialer::serve_status(conn, &status, &route.disconnect_message).await;
            Outcome::closed(LeaveReason::Status)
        }
        MatchAction::Disconnect => {
            dialer::send_disconnect(conn, &route.disconnect_message).await;
            Outcome::closed(LeaveReason::Rejected)
        }
        MatchAction::Forward => {
            let candidate = route
                .addresses
                .first()
                .cloned()
                .unwrap_or_default();
            if let Err(veto) = bus.publish(&Event::PreConnConnecting {
                conn: conn.snapshot(),
                upstream_addr: candidate,
            }) {
                info!(
                    client = %conn.remote_addr,
                    message = %veto.message,
                    "connection vetoed before dial"
                );
                dialer::send_disconnect(conn, &veto.message).await;
                return Outcome::closed(LeaveReason::Vetoed);
            }

            let (mut upstream, upstream_addr) =
                match dialer::dial_route(&route, conn.edition).await {
                    Ok(ok) => ok,
                    Err(e) => {
                        warn!(
                            client = %conn.remote_addr,
                            route = %route.id,
                            error = %e,
                            "all upstream addresses failed"
                        );
                        dialer::send_disconnect(conn, &route.disconnect_message).await;
                        return Outcome::closed(LeaveReason::DialFailed);
                    }
                };

            let _ = bus.publish(&Event::PostLogin {
                conn: conn.snapshot(),
                upstream_addr,
            });

            if let Err(e) =
                dialer::replay_prelude(&mut upstream, upstream_addr, &route, conn).await
            {
                warn!(client = %conn.remote_addr, error = %e, "prelude replay failed");
                return Outcome::closed(LeaveReason::Error);
            }

            stats.record_forwarded();
            let _ = bus.publish(&Event::PlayerJoin {
                conn: conn.snapshot(),
                upstream_addr,
            });
            info!(
                client = %conn.remote_addr,
                host = %conn.requested_host,
                route = %route.id,
                upstream = %upstream_addr,
                username = conn.username.as_deref().unwrap_or("-"),
                "forwarding connection"
            );

            match splice(&mut conn.stream, &mut upstream, route.idle_timeout).await {
                Ok(result) => Outcome {
                    reason: if result.idle_timed_out {
                        LeaveReason::IdleTimeout
                    } else {
                        LeaveReason::Disconnected
                    },
                    bytes_up: result.client_to_upstream,
                    bytes_down: result.upstream_to_client,
                },
                Err(e) => {
                    debug!(client = %conn.remote_addr, error = %e, "pump error");
                    Outcome::closed(LeaveReason::Error)
                }
            }
        }
    }
}
