//! Fakes for the external collaborators, shared by the unit tests.

use crate::{BoxError, BoxedStream, PodInfo, PodLister, PodQuery, ProxyTarget, TunnelTransport};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::io::DuplexStream;

pub(crate) fn agent_pod(name: &str, node: &str, ip: &str) -> PodInfo {
    let mut labels = BTreeMap::new();
    labels.insert("kubeedge".to_string(), "edgemesh-agent".to_string());
    PodInfo {
        name: name.to_string(),
        namespace: "kubeedge".to_string(),
        node_name: node.to_string(),
        labels,
        pod_ip: ip.to_string(),
    }
}

/// Pod lister that records every query.
pub(crate) struct CountingLister {
    pods: Vec<PodInfo>,
    failure: Option<String>,
    hang_on: Option<String>,
    calls: AtomicUsize,
    last: Mutex<Option<PodQuery>>,
}

impl CountingLister {
    pub(crate) fn with_pods(pods: Vec<PodInfo>) -> Self {
        Self {
            pods,
            failure: None,
            hang_on: None,
            calls: AtomicUsize::new(0),
            last: Mutex::new(None),
        }
    }

    pub(crate) fn failing(message: &str) -> Self {
        Self {
            failure: Some(message.to_string()),
            ..Self::with_pods(vec![])
        }
    }

    /// Queries for `node` never complete.
    pub(crate) fn hanging_on(mut self, node: &str) -> Self {
        self.hang_on = Some(node.to_string());
        self
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn last_query(&self) -> Option<PodQuery> {
        self.last.lock().unwrap().clone()
    }
}

#[async_trait]
impl PodLister for CountingLister {
    async fn list_pods(&self, query: &PodQuery) -> Result<Vec<PodInfo>, BoxError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last.lock().unwrap() = Some(query.clone());
        if self.hang_on.as_deref() == Some(query.node_name.as_str()) {
            std::future::pending::<()>().await;
        }
        if let Some(message) = &self.failure {
            return Err(message.clone().into());
        }
        Ok(self
            .pods
            .iter()
            .filter(|p| p.node_name == query.node_name)
            .cloned()
            .collect())
    }
}

enum Mode {
    Succeed,
    Fail(String),
    Hang,
}

/// Tunnel transport backed by in-memory pipes.
///
/// On success the far end of each pipe is kept so a test can play the
/// remote service.
pub(crate) struct FakeTransport {
    mode: Mode,
    requests: Mutex<Vec<ProxyTarget>>,
    remotes: Mutex<Vec<DuplexStream>>,
}

impl FakeTransport {
    fn with_mode(mode: Mode) -> Self {
        Self {
            mode,
            requests: Mutex::new(Vec::new()),
            remotes: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn succeeding() -> Self {
        Self::with_mode(Mode::Succeed)
    }

    pub(crate) fn failing(message: &str) -> Self {
        Self::with_mode(Mode::Fail(message.to_string()))
    }

    pub(crate) fn hanging() -> Self {
        Self::with_mode(Mode::Hang)
    }

    pub(crate) fn requests(&self) -> Vec<ProxyTarget> {
        self.requests.lock().unwrap().clone()
    }

    /// Far end of the most recently opened stream.
    pub(crate) fn take_remote(&self) -> Option<DuplexStream> {
        self.remotes.lock().unwrap().pop()
    }
}

#[async_trait]
impl TunnelTransport for FakeTransport {
    async fn proxy_stream(&self, target: &ProxyTarget) -> Result<BoxedStream, BoxError> {
        self.requests.lock().unwrap().push(target.clone());
        match &self.mode {
            Mode::Succeed => {
                let (local, remote) = tokio::io::duplex(4096);
                self.remotes.lock().unwrap().push(remote);
                Ok(Box::new(local))
            }
            Mode::Fail(message) => Err(message.clone().into()),
            Mode::Hang => std::future::pending().await,
        }
    }
}
