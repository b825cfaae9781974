//! Gates: tagged listeners
//!
//! A gate is one bound listener (TCP for Java, UDP/RakNet for
//! Bedrock) tagged with the gateway it serves. Each accepted
//! connection is processed and served on its own task. Closing a gate
//! stops the accept loop and the socket; connections already processed
//! keep running.

use std::net::SocketAddr;
use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::handler;
use super::ProxyShared;
use crate::bedrock::{self, RaknetListener};
use crate::config::ListenerBinding;
use crate::error::ConnectionError;
use crate::java;
use crate::Edition;

/// One live listener.
pub struct Gate {
    binding: Arc<ArcSwap<ListenerBinding>>,
    local_addr: SocketAddr,
    accept_task: JoinHandle<()>,
}

impl Gate {
    /// Bind and start accepting.
    ///
    /// # Errors
    ///
    /// `BindFailed` when the socket cannot be bound.
    pub async fn open(
        config: ListenerBinding,
        shared: Arc<ProxyShared>,
    ) -> Result<Self, ConnectionError> {
        let bind = config.bind;
        let binding = Arc::new(ArcSwap::from_pointee(config));

        let (local_addr, accept_task) = match shared.edition {
            Edition::Java => {
                let listener = TcpListener::bind(bind).await.map_err(|e| {
                    ConnectionError::BindFailed {
                        addr: bind,
                        reason: e.to_string(),
                    }
                })?;
                let local_addr = listener.local_addr().map_err(ConnectionError::Io)?;
                let task = tokio::spawn(java_accept_loop(listener, binding.clone(), shared));
                (local_addr, task)
            }
            Edition::Bedrock => {
                let motd = binding.load().motd.clone();
                let listener = RaknetListener::bind(bind, motd, rand::random())
                    .await
                    .map_err(|e| ConnectionError::BindFailed {
                        addr: bind,
                        reason: e.to_string(),
                    })?;
                let local_addr = listener.local_addr();
                let task = tokio::spawn(bedrock_accept_loop(listener, binding.clone(), shared));
                (local_addr, task)
            }
        };

        info!(addr = %local_addr, gate = %binding.load().gate_id, "listener started");
        Ok(Self {
            binding,
            local_addr,
            accept_task,
        })
    }

    /// The bound address (useful with port 0 binds).
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The gate id this listener serves.
    #[must_use]
    pub fn gate_id(&self) -> String {
        self.binding.load().gate_id.clone()
    }

    /// Adopt updated timeouts/trust settings without rebinding. New
    /// connections see the new values; in-flight processing keeps the
    /// binding it started with.
    pub fn update(&self, config: ListenerBinding) {
        self.binding.store(Arc::new(config));
    }

    /// Stop accepting and close the socket. Existing connections are
    /// untouched.
    pub fn close(&self) {
        self.accept_task.abort();
        debug!(addr = %self.local_addr, "listener closed");
    }
}

impl Drop for Gate {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn java_accept_loop(
    listener: TcpListener,
    binding: Arc<ArcSwap<ListenerBinding>>,
    shared: Arc<ProxyShared>,
) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };
        let binding = binding.load_full();
        let shared = shared.clone();
        tokio::spawn(async move {
            serve_java(stream, peer, &binding, &shared).await;
        });
    }
}

async fn serve_java(
    stream: tokio::net::TcpStream,
    peer: SocketAddr,
    binding: &ListenerBinding,
    shared: &Arc<ProxyShared>,
) {
    shared.stats.record_accepted();
    match java::processor::process(stream, peer, binding).await {
        Ok(conn) => {
            handler::serve(
                conn,
                shared.engine.snapshot(),
                shared.fallback.load_full(),
                shared.bus.clone(),
                shared.stats.clone(),
                shared.shutdown.subscribe(),
            )
            .await;
        }
        Err(e) => {
            shared.stats.record_handshake_failure();
            shared.stats.record_closed(0, 0);
            debug!(client = %peer, error = %e, "handshake processing failed");
        }
    }
}

async fn bedrock_accept_loop(
    mut listener: RaknetListener,
    binding: Arc<ArcSwap<ListenerBinding>>,
    shared: Arc<ProxyShared>,
) {
    let local_addr = listener.local_addr();
    while let Some(session) = listener.accept().await {
        let binding = binding.load_full();
        let shared = shared.clone();
        tokio::spawn(async move {
            serve_bedrock(session, local_addr, &binding, &shared).await;
        });
    }
}

async fn serve_bedrock(
    session: bedrock::NewSession,
    local_addr: SocketAddr,
    binding: &ListenerBinding,
    shared: &Arc<ProxyShared>,
) {
    let peer = session.peer;
    shared.stats.record_accepted();
    match bedrock::processor::process(session, local_addr, binding).await {
        Ok(conn) => {
            handler::serve(
                conn,
                shared.engine.snapshot(),
                shared.fallback.load_full(),
                shared.bus.clone(),
                shared.stats.clone(),
                shared.shutdown.subscribe(),
            )
            .await;
        }
        Err(e) => {
            shared.stats.record_handshake_failure();
            shared.stats.record_closed(0, 0);
            debug!(client = %peer, error = %e, "handshake processing failed");
        }
    }
}
