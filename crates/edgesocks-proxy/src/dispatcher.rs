//! Hand-off of a parsed request to the mesh tunnel.
//!
//! # Dispatch Flow
//!
//! ```text
//! dispatch(target, client)
//!         |
//!         v
//! TunnelTransport.proxy_stream(tcp, node, ip, port)
//!         |
//!         +-- error --> ProxyError::Tunnel, client closed (no reply by default)
//!         |
//!         v
//! write success reply to client (failure only logged)
//!         |
//!         v
//! spawn relay(client, stream) --> return immediately
//! ```

use crate::codec::{self, DEFAULT_REPLY};
use crate::relay::{is_peer_close, relay};
use crate::{bounded, BoxError, ProxyError, Result, Stage};
use async_trait::async_trait;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Duplex byte stream handed back by a tunnel transport.
pub trait ProxyStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ProxyStream for T {}

pub type BoxedStream = Box<dyn ProxyStream>;

/// Where the tunnel should carry the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyTarget {
    /// Always `"tcp"` for CONNECT.
    pub protocol: &'static str,
    pub node_name: String,
    /// Address of the mesh agent on `node_name`.
    pub ip: IpAddr,
    pub port: u16,
}

impl ProxyTarget {
    pub fn tcp(node_name: impl Into<String>, ip: IpAddr, port: u16) -> Self {
        Self {
            protocol: "tcp",
            node_name: node_name.into(),
            ip,
            port,
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

impl fmt::Display for ProxyTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}/{}", self.protocol, self.node_name, self.socket_addr())
    }
}

/// The secure mesh tunnel, seen from the SOCKS5 side.
///
/// Shared by every connection task; implementations must be safe for
/// concurrent use.
#[async_trait]
pub trait TunnelTransport: Send + Sync {
    async fn proxy_stream(&self, target: &ProxyTarget) -> std::result::Result<BoxedStream, BoxError>;
}

/// Transport that dials the target address directly over TCP.
///
/// For flat networks and local development, where the agent address is
/// routable from this node and no encrypted tunnel is required.
#[derive(Debug, Clone)]
pub struct DirectTransport {
    /// Default: 10 seconds
    pub dial_timeout: Duration,
}

impl Default for DirectTransport {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_secs(10),
        }
    }
}

#[async_trait]
impl TunnelTransport for DirectTransport {
    async fn proxy_stream(&self, target: &ProxyTarget) -> std::result::Result<BoxedStream, BoxError> {
        let addr = target.socket_addr();
        match tokio::time::timeout(self.dial_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => Ok(Box::new(stream)),
            Ok(Err(e)) => Err(Box::new(e)),
            Err(_) => Err(Box::new(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("dial {addr} timed out"),
            ))),
        }
    }
}

/// Acquires tunnel streams and starts relays.
pub struct Dispatcher {
    transport: Arc<dyn TunnelTransport>,
    tunnel_timeout: Duration,
    relay_idle: Duration,
    reply_on_failure: bool,
    tracker: TaskTracker,
}

impl Dispatcher {
    /// Relay tasks are spawned on `tracker` so shutdown can wait for them.
    pub fn new(
        transport: Arc<dyn TunnelTransport>,
        tunnel_timeout: Duration,
        relay_idle: Duration,
        reply_on_failure: bool,
        tracker: TaskTracker,
    ) -> Self {
        Self {
            transport,
            tunnel_timeout,
            relay_idle,
            reply_on_failure,
            tracker,
        }
    }

    /// Connect `client` to `target` through the tunnel.
    ///
    /// Returns once the relay task is running; the relay owns `client` from
    /// then on and stops when either side closes, the relay sits idle for
    /// `relay_idle`, or `cancel` fires.
    ///
    /// # Errors
    /// * `ProxyError::Tunnel` - the transport could not provide a stream
    /// * `ProxyError::Timeout` / `ProxyError::Cancelled` - stream acquisition
    ///   did not finish
    pub async fn dispatch<S>(
        &self,
        target: ProxyTarget,
        mut client: S,
        cancel: &CancellationToken,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let stream = match self.open(&target, cancel).await {
            Ok(stream) => stream,
            Err(e) => {
                if self.reply_on_failure {
                    if let Some(code) = e.reply_code() {
                        // Best-effort: if we can't notify the client, it will see a connection drop.
                        client.write_all(&codec::failure_reply(code)).await.ok();
                    }
                }
                return Err(e);
            }
        };

        info!(%target, "proxying data through tunnel");
        if let Err(e) = client.write_all(&DEFAULT_REPLY).await {
            // The relay notices the dead client on its first read.
            warn!(%target, error = %e, "failed to write success reply");
        }

        let cancel = cancel.clone();
        let idle = self.relay_idle;
        self.tracker.spawn(async move {
            match relay(client, stream, idle, cancel).await {
                Ok((up, down)) => debug!(%target, up, down, "relay finished"),
                Err(e) if is_peer_close(&e) => debug!(%target, "relay closed by peer"),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {
                    debug!(%target, "relay cancelled")
                }
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                    debug!(%target, "relay idle, closing")
                }
                Err(e) => warn!(%target, error = %e, "relay error"),
            }
        });

        Ok(())
    }

    async fn open(&self, target: &ProxyTarget, cancel: &CancellationToken) -> Result<BoxedStream> {
        bounded(Stage::Tunnel, self.tunnel_timeout, cancel, async {
            self.transport
                .proxy_stream(target)
                .await
                .map_err(|source| ProxyError::Tunnel {
                    node: target.node_name.clone(),
                    addr: target.socket_addr(),
                    source,
                })
        })
        .await
    }
}
