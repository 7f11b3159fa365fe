//! SOCKS5 front end for the edge mesh.
//!
//! `edgesocks-proxy` accepts SOCKS5 CONNECT requests whose destination is a
//! cluster node name, looks up the mesh agent running on that node, and
//! hands the client connection to the mesh tunnel for cross-node relay.
//!
//! # Architecture
//!
//! ```text
//! Application (SOCKS5 client)
//!       |
//!       v
//! ProxyServer (accept loop, one task per connection)
//!       |
//!       v
//! ConnectionHandler
//!       |
//!       +-- codec: handshake, request
//!       |
//!       +-- policy: domain destination, not the local node, CONNECT only
//!       |
//!       +-- Resolver: node name --> mesh agent pod IP (PodLister)
//!       |
//!       +-- Dispatcher: TunnelTransport stream --> success reply --> relay task
//! ```
//!
//! # Components
//!
//! - [`codec`]: byte-exact SOCKS5 handshake/request reading and replies
//! - [`ConnectionHandler`]: per-connection state machine
//! - [`Resolver`]: node name to agent IP via a [`PodLister`]
//! - [`Dispatcher`]: tunnel stream acquisition and relay spawn via a [`TunnelTransport`]
//! - [`ProxyServer`]: listener, accept loop, and orderly shutdown
//!
//! # Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use edgesocks_proxy::{DirectTransport, ProxyConfig, ProxyServer, StaticPodLister};
//!
//! let config = ProxyConfig::new("edge-node-1");
//! let server = ProxyServer::new(
//!     config,
//!     Arc::new(StaticPodLister::default()),
//!     Arc::new(DirectTransport::default()),
//! )?;
//! let handle = server.start().await?;
//! // ... later ...
//! handle.shutdown().await?;
//! ```
//!
//! # Failure model
//!
//! Every error is handled at the boundary of the connection that produced it.
//! By default a failed or rejected connection is closed without a SOCKS5
//! failure reply; see [`ProxyConfig::reply_on_failure`].

pub mod codec;
mod connection;
mod dispatcher;
mod relay;
mod resolver;
mod server;

#[cfg(test)]
mod testing;

pub use codec::{AddressType, Command, ProtocolError, Request};
pub use connection::{ConnectionHandler, ConnectionState, Timeouts};
pub use dispatcher::{BoxedStream, DirectTransport, Dispatcher, ProxyStream, ProxyTarget, TunnelTransport};
pub use relay::relay;
pub use resolver::{
    InvalidSelector, LabelSelector, PodInfo, PodLister, PodQuery, Resolver, ResolverConfig,
    StaticPodLister,
};
pub use server::{ProxyConfig, ProxyHandle, ProxyServer};

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Boxed error returned by external collaborators (cluster backend, tunnel).
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Result type for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Errors that can occur while serving a SOCKS5 connection.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// Failed to bind to address.
    #[error("Failed to bind to {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// Invalid configuration provided.
    #[error("Invalid proxy config: {0}")]
    InvalidConfig(String),

    /// Malformed or unsupported handshake/request bytes.
    #[error("SOCKS5 protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Well-formed request refused by policy.
    #[error("Request rejected: {0}")]
    Rejected(#[from] Rejection),

    /// No mesh agent pod is running on the destination node.
    #[error("edgemesh agent not found on node [{node}]")]
    AgentNotFound { node: String },

    /// The cluster backend query for the destination node failed.
    #[error("edgemesh agent lookup on node [{node}] failed: {source}")]
    Discovery {
        node: String,
        #[source]
        source: BoxError,
    },

    /// The tunnel transport could not provide a relay stream.
    #[error("Tunnel stream to {node} ({addr}) unavailable: {source}")]
    Tunnel {
        node: String,
        addr: SocketAddr,
        #[source]
        source: BoxError,
    },

    /// A bounded step did not finish in time.
    #[error("{stage} timed out after {after:?}")]
    Timeout { stage: Stage, after: Duration },

    /// The connection was cancelled by server shutdown.
    #[error("{stage} cancelled by shutdown")]
    Cancelled { stage: Stage },

    /// I/O error on the client stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    /// True for both "no agent pod" and "backend query failed".
    ///
    /// The two are one failure class from the client's point of view: the
    /// destination node cannot be located.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::AgentNotFound { .. } | Self::Discovery { .. })
    }

    /// True for policy rejections, which are logged at warn level.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Rejected(_))
    }

    /// RFC 1928 reply code describing this failure, if a reply makes sense.
    ///
    /// Handshake-level failures return `None`: the client never reached the
    /// request phase, so there is nothing to reply to.
    pub fn reply_code(&self) -> Option<u8> {
        match self {
            Self::Rejected(Rejection::UnsupportedCommand(_)) => {
                Some(codec::reply::COMMAND_NOT_SUPPORTED)
            }
            Self::Rejected(_) => Some(codec::reply::CONNECTION_NOT_ALLOWED),
            Self::Protocol(ProtocolError::UnsupportedAddressType(_)) => {
                Some(codec::reply::ADDRESS_TYPE_NOT_SUPPORTED)
            }
            Self::AgentNotFound { .. } | Self::Discovery { .. } => {
                Some(codec::reply::HOST_UNREACHABLE)
            }
            Self::Tunnel { .. } => Some(codec::reply::GENERAL_FAILURE),
            Self::Timeout { stage, .. } if stage.after_request() => {
                Some(codec::reply::GENERAL_FAILURE)
            }
            _ => None,
        }
    }
}

/// Well-formed requests the agent refuses to relay.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Rejection {
    /// Destination given as an IP literal instead of a node name.
    #[error("destination {addr} is an IP literal; only node names are relayed")]
    IpDestination { addr: String },

    /// Destination is this agent's own node.
    #[error("destination {node} is the local node")]
    SelfNode { node: String },

    /// Anything other than CONNECT.
    #[error("command {0} is not supported")]
    UnsupportedCommand(Command),
}

/// Suspension points of a connection, for timeout and cancellation errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Handshake,
    Request,
    Resolve,
    Tunnel,
}

impl Stage {
    fn after_request(self) -> bool {
        matches!(self, Self::Resolve | Self::Tunnel)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Handshake => "handshake",
            Self::Request => "request",
            Self::Resolve => "resolve",
            Self::Tunnel => "tunnel",
        };
        f.write_str(name)
    }
}

/// Run `fut` under a deadline and a cancellation token.
///
/// Whichever comes first wins: completion, `limit` elapsing, or `cancel`
/// firing.
pub(crate) async fn bounded<T, F>(
    stage: Stage,
    limit: Duration,
    cancel: &CancellationToken,
    fut: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        _ = cancel.cancelled() => Err(ProxyError::Cancelled { stage }),
        res = tokio::time::timeout(limit, fut) => match res {
            Ok(inner) => inner,
            Err(_) => Err(ProxyError::Timeout { stage, after: limit }),
        },
    }
}
