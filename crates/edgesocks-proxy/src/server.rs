//! Listener, accept loop and lifecycle.
//!
//! # Lifecycle
//!
//! ```text
//! ProxyServer::new(config, lister, transport)
//!       |
//!       v
//! ProxyServer::start() --> ProxyHandle
//!       |                       |
//!       v                       |
//! accept loop                   |
//! (one task per connection,     |
//!  one task per relay)          v
//!       |               ProxyHandle::shutdown()
//!       |                       |
//!       v                       v
//! stop accepting <--------------+
//!       |
//!       v
//! wait for in-flight tasks (grace period)
//!       |
//!       v
//! cancel the rest, wait again
//! ```

use crate::connection::{ConnectionHandler, Timeouts};
use crate::dispatcher::{Dispatcher, TunnelTransport};
use crate::resolver::{PodLister, Resolver, ResolverConfig};
use crate::{ProxyError, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// How long to wait for the accept loop and for cancelled tasks to exit.
const STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// Configuration for the SOCKS5 server.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Listen address.
    /// Default: `127.0.0.1:10800`
    pub bind_addr: SocketAddr,

    /// Name of the node this agent runs on. Requests for it are rejected.
    pub node_name: String,

    /// Which pods count as mesh agents.
    pub resolver: ResolverConfig,

    pub timeouts: Timeouts,

    /// Maximum tasks (connections being negotiated plus running relays).
    /// Default: 1024
    pub max_connections: usize,

    /// Send an RFC 1928 failure reply before closing a failed connection.
    /// Default: `false` (close without a reply)
    pub reply_on_failure: bool,

    /// Time in-flight connections get to finish on shutdown.
    /// Default: 5 seconds
    pub shutdown_grace: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:10800".parse().expect("hardcoded loopback address"),
            node_name: String::new(),
            resolver: ResolverConfig::default(),
            timeouts: Timeouts::default(),
            max_connections: 1024,
            reply_on_failure: false,
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl ProxyConfig {
    /// Default configuration for the agent on `node_name`.
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
            ..Default::default()
        }
    }
}

/// Handle for controlling a running server.
pub struct ProxyHandle {
    local_addr: SocketAddr,
    stop_accepting: CancellationToken,
    cancel_connections: CancellationToken,
    tracker: TaskTracker,
    accept_task: Option<JoinHandle<()>>,
    shutdown_grace: Duration,
}

impl ProxyHandle {
    /// Address the listener is bound to (with the OS-assigned port, if any).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Connection and relay tasks currently in flight.
    pub fn active_connections(&self) -> usize {
        self.tracker.len()
    }

    pub fn is_running(&self) -> bool {
        self.accept_task
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Stop accepting, then drain in-flight connections.
    ///
    /// Connections still running after the grace period are cancelled.
    ///
    /// # Errors
    /// Currently infallible; always returns `Ok`.
    pub async fn shutdown(mut self) -> Result<()> {
        self.stop_accepting.cancel();
        if let Some(handle) = self.accept_task.take() {
            if tokio::time::timeout(STOP_TIMEOUT, handle).await.is_err() {
                warn!("accept loop did not stop in time");
            }
        }

        self.tracker.close();
        let in_flight = self.tracker.len();
        if in_flight > 0 {
            info!(in_flight, grace = ?self.shutdown_grace, "waiting for connections to finish");
        }
        if tokio::time::timeout(self.shutdown_grace, self.tracker.wait())
            .await
            .is_err()
        {
            warn!(remaining = self.tracker.len(), "grace period over, cancelling connections");
            self.cancel_connections.cancel();
            if tokio::time::timeout(STOP_TIMEOUT, self.tracker.wait())
                .await
                .is_err()
            {
                // Tasks will still observe the token; nothing left to wait for here.
                warn!(remaining = self.tracker.len(), "connections did not stop after cancel");
            }
        }

        info!(addr = %self.local_addr, "SOCKS5 server stopped");
        Ok(())
    }
}

/// SOCKS5 server for the edge mesh.
pub struct ProxyServer {
    config: ProxyConfig,
    lister: Arc<dyn PodLister>,
    transport: Arc<dyn TunnelTransport>,
}

impl ProxyServer {
    /// Create a server with its collaborators.
    ///
    /// # Errors
    /// * `ProxyError::InvalidConfig` - empty node name or a zero connection
    ///   limit.
    pub fn new(
        config: ProxyConfig,
        lister: Arc<dyn PodLister>,
        transport: Arc<dyn TunnelTransport>,
    ) -> Result<Self> {
        if config.node_name.trim().is_empty() {
            return Err(ProxyError::InvalidConfig("node name is empty".to_string()));
        }
        if config.max_connections == 0 {
            return Err(ProxyError::InvalidConfig(
                "max_connections must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            config,
            lister,
            transport,
        })
    }

    /// Bind the listener and spawn the accept loop.
    ///
    /// # Errors
    /// * `ProxyError::Bind` - binding `config.bind_addr` failed.
    pub async fn start(self) -> Result<ProxyHandle> {
        let bind_addr = self.config.bind_addr;
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| ProxyError::Bind {
                addr: bind_addr,
                source: e,
            })?;
        let local_addr = listener.local_addr().map_err(|e| ProxyError::Bind {
            addr: bind_addr,
            source: e,
        })?;

        let tracker = TaskTracker::new();
        let stop_accepting = CancellationToken::new();
        let cancel_connections = CancellationToken::new();

        let resolver = Arc::new(Resolver::new(self.lister, self.config.resolver.clone()));
        let dispatcher = Arc::new(Dispatcher::new(
            self.transport,
            self.config.timeouts.tunnel,
            self.config.timeouts.relay_idle,
            self.config.reply_on_failure,
            tracker.clone(),
        ));
        let handler = ConnectionHandler::new(
            self.config.node_name.as_str(),
            resolver,
            dispatcher,
            self.config.timeouts,
            self.config.reply_on_failure,
        );

        let acceptor = Acceptor {
            listener,
            handler,
            tracker: tracker.clone(),
            stop: stop_accepting.clone(),
            connections: cancel_connections.clone(),
            max_connections: self.config.max_connections,
        };
        let accept_task = tokio::spawn(acceptor.run());

        info!(addr = %local_addr, node = %self.config.node_name, "SOCKS5 server listening");

        Ok(ProxyHandle {
            local_addr,
            stop_accepting,
            cancel_connections,
            tracker,
            accept_task: Some(accept_task),
            shutdown_grace: self.config.shutdown_grace,
        })
    }
}

struct Acceptor {
    listener: TcpListener,
    handler: ConnectionHandler,
    tracker: TaskTracker,
    stop: CancellationToken,
    connections: CancellationToken,
    max_connections: usize,
}

impl Acceptor {
    async fn run(self) {
        loop {
            let accepted = tokio::select! {
                _ = self.stop.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };
            let (client, peer) = match accepted {
                Ok(result) => result,
                Err(e) => {
                    warn!(error = %e, "TCP accept error");
                    continue;
                }
            };

            if self.tracker.len() >= self.max_connections {
                warn!(%peer, "Connection limit reached, rejecting");
                drop(client);
                continue;
            }

            let handler = self.handler.clone();
            let cancel = self.connections.child_token();
            self.tracker.spawn(async move {
                let state = handler.handle(client, peer, cancel).await;
                debug!(%peer, ?state, "connection finished");
            });
        }
        debug!("accept loop stopped");
    }
}
