//! Per-connection state machine.
//!
//! ```text
//! New --handshake--> HandshakeDone --request--> RequestParsed --+--> Dispatched
//!  |                     |                          |            |
//!  +---------------------+--------------------------+            +--> Rejected
//!                        |                                       |
//!                        v                                       +--> Failed
//!                      Failed
//! ```
//!
//! The client stream is dropped exactly once on every terminal path except
//! `Dispatched`, where the relay task takes ownership of it.

use crate::codec::{self, AddressType, Command, Request};
use crate::dispatcher::{Dispatcher, ProxyTarget};
use crate::resolver::Resolver;
use crate::{bounded, ProxyError, Rejection, Result, Stage};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Where a connection ended up, or how far it got.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    HandshakeDone,
    RequestParsed,
    /// Handed to a relay task.
    Dispatched,
    /// Refused by policy.
    Rejected,
    Failed,
}

/// Deadlines for the suspension points of a connection.
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    /// Bounds the handshake read and, separately, the request read.
    ///
    /// Default: 10 seconds
    pub handshake: Duration,

    /// Default: 5 seconds
    pub resolve: Duration,

    /// Default: 10 seconds
    pub tunnel: Duration,

    /// A relay with no traffic in either direction for this long is closed.
    ///
    /// Default: 300 seconds
    pub relay_idle: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            handshake: Duration::from_secs(10),
            resolve: Duration::from_secs(5),
            tunnel: Duration::from_secs(10),
            relay_idle: Duration::from_secs(300),
        }
    }
}

/// Drives one accepted client connection from handshake to dispatch.
///
/// Cheap to clone; every connection task gets its own copy.
#[derive(Clone)]
pub struct ConnectionHandler {
    node_name: Arc<str>,
    resolver: Arc<Resolver>,
    dispatcher: Arc<Dispatcher>,
    timeouts: Timeouts,
    reply_on_failure: bool,
}

impl ConnectionHandler {
    pub fn new(
        node_name: impl Into<Arc<str>>,
        resolver: Arc<Resolver>,
        dispatcher: Arc<Dispatcher>,
        timeouts: Timeouts,
        reply_on_failure: bool,
    ) -> Self {
        Self {
            node_name: node_name.into(),
            resolver,
            dispatcher,
            timeouts,
            reply_on_failure,
        }
    }

    /// Serve `stream` and return its terminal state.
    ///
    /// Never returns an error: every failure is logged here, at the boundary
    /// of the connection that produced it.
    pub async fn handle<S>(
        &self,
        mut stream: S,
        peer: SocketAddr,
        cancel: CancellationToken,
    ) -> ConnectionState
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut state = ConnectionState::New;
        let target = match self.prepare(&mut stream, peer, &mut state, &cancel).await {
            Ok(target) => target,
            Err(e) => return self.fail(stream, peer, state, e).await,
        };

        match self.dispatcher.dispatch(target, stream, &cancel).await {
            Ok(()) => ConnectionState::Dispatched,
            Err(e) => {
                // The dispatcher already answered the client if configured to.
                log_failure(peer, state, &e);
                ConnectionState::Failed
            }
        }
    }

    /// Handshake, request, policy and resolution, in that order.
    async fn prepare<S>(
        &self,
        stream: &mut S,
        peer: SocketAddr,
        state: &mut ConnectionState,
        cancel: &CancellationToken,
    ) -> Result<ProxyTarget>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        bounded(Stage::Handshake, self.timeouts.handshake, cancel, async {
            codec::read_handshake(stream).await
        })
        .await?;
        *state = ConnectionState::HandshakeDone;

        let request = bounded(Stage::Request, self.timeouts.handshake, cancel, async {
            codec::read_request(stream).await
        })
        .await?;
        *state = ConnectionState::RequestParsed;
        debug!(%peer, command = %request.command, dst = %request.dst_addr, port = request.dst_port, "request parsed");

        self.check_policy(&request)?;

        let node = request.dst_addr;
        let ip = bounded(Stage::Resolve, self.timeouts.resolve, cancel, self.resolver.resolve(&node))
            .await?;
        info!(%peer, %node, %ip, port = request.dst_port, "resolved destination");

        Ok(ProxyTarget::tcp(node, ip, request.dst_port))
    }

    /// Only CONNECT to another node, named by domain, enters the tunnel.
    fn check_policy(&self, request: &Request) -> Result<()> {
        if request.address_type != AddressType::Domain {
            return Err(Rejection::IpDestination {
                addr: request.dst_addr.clone(),
            }
            .into());
        }
        if request.dst_addr == *self.node_name {
            return Err(Rejection::SelfNode {
                node: request.dst_addr.clone(),
            }
            .into());
        }
        if request.command != Command::Connect {
            return Err(Rejection::UnsupportedCommand(request.command).into());
        }
        Ok(())
    }

    async fn fail<S>(
        &self,
        mut stream: S,
        peer: SocketAddr,
        state: ConnectionState,
        err: ProxyError,
    ) -> ConnectionState
    where
        S: AsyncWrite + Unpin,
    {
        log_failure(peer, state, &err);

        if self.reply_on_failure {
            if let Some(code) = err.reply_code() {
                if let Err(e) = stream.write_all(&codec::failure_reply(code)).await {
                    debug!(%peer, error = %e, "failed to write failure reply");
                }
            }
        }

        if err.is_rejection() {
            ConnectionState::Rejected
        } else {
            ConnectionState::Failed
        }
    }
}

fn log_failure(peer: SocketAddr, state: ConnectionState, err: &ProxyError) {
    match err {
        ProxyError::Rejected(_) => warn!(%peer, error = %err, "request rejected"),
        ProxyError::Cancelled { .. } => debug!(%peer, ?state, "connection cancelled"),
        _ => error!(%peer, ?state, error = %err, "connection failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{reply, DEFAULT_REPLY};
    use crate::resolver::ResolverConfig;
    use crate::testing::{agent_pod, CountingLister, FakeTransport};
    use tokio::io::AsyncReadExt;
    use tokio_util::task::TaskTracker;

    const SELF_NODE: &str = "edge-1";

    struct Fixture {
        handler: ConnectionHandler,
        lister: Arc<CountingLister>,
        transport: Arc<FakeTransport>,
        tracker: TaskTracker,
    }

    fn fixture(lister: CountingLister, transport: FakeTransport, reply_on_failure: bool) -> Fixture {
        let lister = Arc::new(lister);
        let transport = Arc::new(transport);
        let tracker = TaskTracker::new();
        let timeouts = Timeouts {
            handshake: Duration::from_secs(1),
            resolve: Duration::from_millis(200),
            tunnel: Duration::from_millis(200),
            relay_idle: Duration::from_secs(60),
        };
        let resolver = Arc::new(Resolver::new(lister.clone(), ResolverConfig::default()));
        let dispatcher = Arc::new(Dispatcher::new(
            transport.clone(),
            timeouts.tunnel,
            timeouts.relay_idle,
            reply_on_failure,
            tracker.clone(),
        ));
        let handler = ConnectionHandler::new(SELF_NODE, resolver, dispatcher, timeouts, reply_on_failure);
        Fixture {
            handler,
            lister,
            transport,
            tracker,
        }
    }

    fn default_fixture() -> Fixture {
        fixture(
            CountingLister::with_pods(vec![agent_pod("edgemesh-agent-x7k2p", "my-node1", "10.0.0.5")]),
            FakeTransport::succeeding(),
            false,
        )
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:50000".parse().unwrap()
    }

    fn domain_request(cmd: u8, name: &str, port: u16) -> Vec<u8> {
        let mut bytes = vec![0x05, cmd, 0x00, 0x03, name.len() as u8];
        bytes.extend_from_slice(name.as_bytes());
        bytes.extend_from_slice(&port.to_be_bytes());
        bytes
    }

    // ========================================================================
    // End-to-end
    // ========================================================================

    #[tokio::test]
    async fn test_connect_byte_exact() {
        let f = default_fixture();
        let stream = tokio_test::io::Builder::new()
            .read(&[0x05, 0x01, 0x00])
            .write(&[0x05, 0x00])
            .read(&[
                0x05, 0x01, 0x00, 0x03, 0x08, 0x6d, 0x79, 0x2d, 0x6e, 0x6f, 0x64, 0x65, 0x31, 0x1f,
                0x90,
            ])
            .write(&[0x05, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00])
            .build();

        let state = f.handler.handle(stream, peer(), CancellationToken::new()).await;
        assert_eq!(state, ConnectionState::Dispatched);

        let requests = f.transport.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].protocol, "tcp");
        assert_eq!(requests[0].node_name, "my-node1");
        assert_eq!(requests[0].ip.to_string(), "10.0.0.5");
        assert_eq!(requests[0].port, 8080);

        drop(f.transport.take_remote());
        f.tracker.close();
        f.tracker.wait().await;
    }

    #[tokio::test]
    async fn test_connect_relays_data() {
        let f = default_fixture();
        let (server_side, mut client) = tokio::io::duplex(1024);
        let handler = f.handler.clone();
        let task = tokio::spawn(async move {
            handler.handle(server_side, peer(), CancellationToken::new()).await
        });

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();
        assert_eq!(method, [0x05, 0x00]);

        client
            .write_all(&domain_request(0x01, "my-node1", 8080))
            .await
            .unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, DEFAULT_REPLY);
        assert_eq!(task.await.unwrap(), ConnectionState::Dispatched);

        let mut remote = f.transport.take_remote().unwrap();
        client.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        remote.write_all(b"world").await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"world");
    }

    // ========================================================================
    // Policy
    // ========================================================================

    #[tokio::test]
    async fn test_self_node_rejected_without_query() {
        let f = default_fixture();
        let stream = tokio_test::io::Builder::new()
            .read(&[0x05, 0x01, 0x00])
            .write(&[0x05, 0x00])
            .read(&domain_request(0x01, SELF_NODE, 80))
            .build();

        let state = f.handler.handle(stream, peer(), CancellationToken::new()).await;
        assert_eq!(state, ConnectionState::Rejected);
        assert_eq!(f.lister.calls(), 0);
        assert!(f.transport.requests().is_empty());
    }

    #[tokio::test]
    async fn test_ip_destination_rejected() {
        let f = default_fixture();
        let stream = tokio_test::io::Builder::new()
            .read(&[0x05, 0x01, 0x00])
            .write(&[0x05, 0x00])
            .read(&[0x05, 0x01, 0x00, 0x01, 10, 0, 0, 5, 0x1f, 0x90])
            .build();

        let state = f.handler.handle(stream, peer(), CancellationToken::new()).await;
        assert_eq!(state, ConnectionState::Rejected);
        assert_eq!(f.lister.calls(), 0);
        assert!(f.transport.requests().is_empty());
    }

    #[tokio::test]
    async fn test_ipv6_destination_rejected() {
        let f = default_fixture();
        let mut request = vec![0x05, 0x01, 0x00, 0x04];
        request.extend_from_slice(&[0u8; 15]);
        request.push(1);
        request.extend_from_slice(&443u16.to_be_bytes());
        let stream = tokio_test::io::Builder::new()
            .read(&[0x05, 0x01, 0x00])
            .write(&[0x05, 0x00])
            .read(&request)
            .build();

        let state = f.handler.handle(stream, peer(), CancellationToken::new()).await;
        assert_eq!(state, ConnectionState::Rejected);
        assert_eq!(f.lister.calls(), 0);
    }

    #[tokio::test]
    async fn test_bind_command_rejected_before_resolution() {
        let f = default_fixture();
        let stream = tokio_test::io::Builder::new()
            .read(&[0x05, 0x01, 0x00])
            .write(&[0x05, 0x00])
            .read(&domain_request(0x02, "my-node1", 8080))
            .build();

        let state = f.handler.handle(stream, peer(), CancellationToken::new()).await;
        assert_eq!(state, ConnectionState::Rejected);
        assert_eq!(f.lister.calls(), 0);
        assert!(f.transport.requests().is_empty());
    }

    // ========================================================================
    // Failures
    // ========================================================================

    #[tokio::test]
    async fn test_handshake_failure() {
        let f = default_fixture();
        // Only username/password offered.
        let stream = tokio_test::io::Builder::new()
            .read(&[0x05, 0x01, 0x02])
            .build();

        let state = f.handler.handle(stream, peer(), CancellationToken::new()).await;
        assert_eq!(state, ConnectionState::Failed);
        assert_eq!(f.lister.calls(), 0);
    }

    #[tokio::test]
    async fn test_wrong_request_version_fails() {
        let f = default_fixture();
        let stream = tokio_test::io::Builder::new()
            .read(&[0x05, 0x01, 0x00])
            .write(&[0x05, 0x00])
            .read(&[0x04, 0x01, 0x00, 0x03])
            .build();

        let state = f.handler.handle(stream, peer(), CancellationToken::new()).await;
        assert_eq!(state, ConnectionState::Failed);
    }

    #[tokio::test]
    async fn test_agent_not_found_skips_tunnel() {
        let f = fixture(
            CountingLister::with_pods(vec![]),
            FakeTransport::succeeding(),
            false,
        );
        let stream = tokio_test::io::Builder::new()
            .read(&[0x05, 0x01, 0x00])
            .write(&[0x05, 0x00])
            .read(&domain_request(0x01, "my-node1", 8080))
            .build();

        let state = f.handler.handle(stream, peer(), CancellationToken::new()).await;
        assert_eq!(state, ConnectionState::Failed);
        assert_eq!(f.lister.calls(), 1);
        assert!(f.transport.requests().is_empty());
    }

    #[tokio::test]
    async fn test_backend_error_skips_tunnel() {
        let f = fixture(
            CountingLister::failing("apiserver unreachable"),
            FakeTransport::succeeding(),
            false,
        );
        let stream = tokio_test::io::Builder::new()
            .read(&[0x05, 0x01, 0x00])
            .write(&[0x05, 0x00])
            .read(&domain_request(0x01, "my-node1", 8080))
            .build();

        let state = f.handler.handle(stream, peer(), CancellationToken::new()).await;
        assert_eq!(state, ConnectionState::Failed);
        assert!(f.transport.requests().is_empty());
    }

    #[tokio::test]
    async fn test_tunnel_failure_closes_silently() {
        let f = fixture(
            CountingLister::with_pods(vec![agent_pod("edgemesh-agent-a", "my-node1", "10.0.0.5")]),
            FakeTransport::failing("no route"),
            false,
        );
        let stream = tokio_test::io::Builder::new()
            .read(&[0x05, 0x01, 0x00])
            .write(&[0x05, 0x00])
            .read(&domain_request(0x01, "my-node1", 8080))
            .build();

        let state = f.handler.handle(stream, peer(), CancellationToken::new()).await;
        assert_eq!(state, ConnectionState::Failed);
        assert_eq!(f.transport.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_hung_resolver_times_out() {
        let f = fixture(
            CountingLister::with_pods(vec![]).hanging_on("my-node1"),
            FakeTransport::succeeding(),
            false,
        );
        let stream = tokio_test::io::Builder::new()
            .read(&[0x05, 0x01, 0x00])
            .write(&[0x05, 0x00])
            .read(&domain_request(0x01, "my-node1", 8080))
            .build();

        let state = f.handler.handle(stream, peer(), CancellationToken::new()).await;
        assert_eq!(state, ConnectionState::Failed);
        assert!(f.transport.requests().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_stops_pending_resolution() {
        let f = fixture(
            CountingLister::with_pods(vec![]).hanging_on("my-node1"),
            FakeTransport::succeeding(),
            false,
        );
        let (server_side, mut client) = tokio::io::duplex(1024);
        let cancel = CancellationToken::new();
        let handler = f.handler.clone();
        let token = cancel.clone();
        let task = tokio::spawn(async move { handler.handle(server_side, peer(), token).await });

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();
        client
            .write_all(&domain_request(0x01, "my-node1", 8080))
            .await
            .unwrap();

        while f.lister.calls() == 0 {
            tokio::task::yield_now().await;
        }
        cancel.cancel();
        assert_eq!(task.await.unwrap(), ConnectionState::Failed);
    }

    // ========================================================================
    // Failure replies
    // ========================================================================

    #[tokio::test]
    async fn test_reply_on_failure_self_node() {
        let f = fixture(CountingLister::with_pods(vec![]), FakeTransport::succeeding(), true);
        let stream = tokio_test::io::Builder::new()
            .read(&[0x05, 0x01, 0x00])
            .write(&[0x05, 0x00])
            .read(&domain_request(0x01, SELF_NODE, 80))
            .write(&codec::failure_reply(reply::CONNECTION_NOT_ALLOWED))
            .build();

        let state = f.handler.handle(stream, peer(), CancellationToken::new()).await;
        assert_eq!(state, ConnectionState::Rejected);
    }

    #[tokio::test]
    async fn test_reply_on_failure_not_found() {
        let f = fixture(CountingLister::with_pods(vec![]), FakeTransport::succeeding(), true);
        let stream = tokio_test::io::Builder::new()
            .read(&[0x05, 0x01, 0x00])
            .write(&[0x05, 0x00])
            .read(&domain_request(0x01, "my-node1", 8080))
            .write(&codec::failure_reply(reply::HOST_UNREACHABLE))
            .build();

        let state = f.handler.handle(stream, peer(), CancellationToken::new()).await;
        assert_eq!(state, ConnectionState::Failed);
    }

    #[tokio::test]
    async fn test_reply_on_failure_unsupported_command() {
        let f = fixture(CountingLister::with_pods(vec![]), FakeTransport::succeeding(), true);
        let stream = tokio_test::io::Builder::new()
            .read(&[0x05, 0x01, 0x00])
            .write(&[0x05, 0x00])
            .read(&domain_request(0x03, "my-node1", 8080))
            .write(&codec::failure_reply(reply::COMMAND_NOT_SUPPORTED))
            .build();

        let state = f.handler.handle(stream, peer(), CancellationToken::new()).await;
        assert_eq!(state, ConnectionState::Rejected);
    }

    #[tokio::test]
    async fn test_reply_on_failure_tunnel_written_once() {
        let f = fixture(
            CountingLister::with_pods(vec![agent_pod("edgemesh-agent-a", "my-node1", "10.0.0.5")]),
            FakeTransport::failing("no route"),
            true,
        );
        let stream = tokio_test::io::Builder::new()
            .read(&[0x05, 0x01, 0x00])
            .write(&[0x05, 0x00])
            .read(&domain_request(0x01, "my-node1", 8080))
            .write(&codec::failure_reply(reply::GENERAL_FAILURE))
            .build();

        let state = f.handler.handle(stream, peer(), CancellationToken::new()).await;
        assert_eq!(state, ConnectionState::Failed);
    }

    #[tokio::test]
    async fn test_no_reply_for_handshake_failure_even_when_enabled() {
        let f = fixture(CountingLister::with_pods(vec![]), FakeTransport::succeeding(), true);
        let stream = tokio_test::io::Builder::new().read(&[0x04, 0x01]).build();

        let state = f.handler.handle(stream, peer(), CancellationToken::new()).await;
        assert_eq!(state, ConnectionState::Failed);
    }
}
