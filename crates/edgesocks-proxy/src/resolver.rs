//! Node name to mesh agent address resolution.
//!
//! The destination of a request is a cluster node name. Traffic cannot be
//! sent to the node's own address (users may renumber the node or the edge
//! runtime), so the agent looks up the mesh agent pod scheduled on that node
//! and uses its pod IP instead.
//!
//! # Resolution Flow
//!
//! ```text
//! resolve(node)
//!      |
//!      v
//! PodLister.list_pods(namespace, spec.nodeName=node, agent label)
//!      |
//!      +-- backend error --> ProxyError::Discovery
//!      |
//!      v
//! keep pods whose name contains the agent name and that have a pod IP
//!      |
//!      +-- none --> ProxyError::AgentNotFound
//!      |
//!      v
//! smallest pod name wins --> IpAddr
//! ```
//!
//! Results are never cached: the agent pod can be rescheduled at any time
//! and a stale address is worse than an extra query.

use crate::{BoxError, ProxyError, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;

/// Namespace the mesh agents run in.
pub const DEFAULT_NAMESPACE: &str = "kubeedge";

/// Label carried by every mesh agent pod.
pub const DEFAULT_AGENT_LABEL: &str = "kubeedge=edgemesh-agent";

/// Substring of every mesh agent pod name.
pub const DEFAULT_AGENT_NAME: &str = "edgemesh-agent";

/// Filtered pod listing, as a cluster API would evaluate it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodQuery {
    pub namespace: String,
    /// Field selector `spec.nodeName=<node_name>`.
    pub node_name: String,
    pub label_selector: LabelSelector,
}

/// The subset of pod metadata the resolver needs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PodInfo {
    pub name: String,
    pub namespace: String,
    pub node_name: String,
    pub labels: BTreeMap<String, String>,
    /// `status.podIP`; empty while the pod is pending.
    pub pod_ip: String,
}

/// Cluster metadata backend.
///
/// Implementations must be safe for concurrent use: one handle is shared by
/// every connection task.
#[async_trait]
pub trait PodLister: Send + Sync {
    async fn list_pods(&self, query: &PodQuery) -> std::result::Result<Vec<PodInfo>, BoxError>;
}

/// Equality-based label selector (`k=v[,k=v...]`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector {
    requirements: Vec<(String, String)>,
}

/// Label selector text that is not a list of `key=value` pairs.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid label selector {0:?}: expected key=value[,key=value...]")]
pub struct InvalidSelector(pub String);

impl LabelSelector {
    /// True when every requirement is present in `labels` with the same value.
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.requirements
            .iter()
            .all(|(k, v)| labels.get(k).is_some_and(|actual| actual == v))
    }
}

impl FromStr for LabelSelector {
    type Err = InvalidSelector;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let mut requirements = Vec::new();
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| InvalidSelector(s.to_string()))?;
            let key = key.trim();
            if key.is_empty() {
                return Err(InvalidSelector(s.to_string()));
            }
            requirements.push((key.to_string(), value.trim().to_string()));
        }
        Ok(Self { requirements })
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (k, v)) in self.requirements.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{k}={v}")?;
        }
        Ok(())
    }
}

/// Which pods count as mesh agents.
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Default: `kubeedge`
    pub namespace: String,

    /// Default: `kubeedge=edgemesh-agent`
    pub agent_label: LabelSelector,

    /// Default: `edgemesh-agent`
    pub agent_name_filter: String,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            agent_label: DEFAULT_AGENT_LABEL
                .parse()
                .expect("hardcoded label selector"),
            agent_name_filter: DEFAULT_AGENT_NAME.to_string(),
        }
    }
}

/// Maps node names to the pod IP of the mesh agent on that node.
pub struct Resolver {
    lister: Arc<dyn PodLister>,
    config: ResolverConfig,
}

impl Resolver {
    pub fn new(lister: Arc<dyn PodLister>, config: ResolverConfig) -> Self {
        Self { lister, config }
    }

    /// Look up the mesh agent address for `node_name`.
    ///
    /// # Errors
    /// * `ProxyError::Discovery` - the backend query failed
    /// * `ProxyError::AgentNotFound` - no agent pod with an IP on the node
    pub async fn resolve(&self, node_name: &str) -> Result<IpAddr> {
        let query = PodQuery {
            namespace: self.config.namespace.clone(),
            node_name: node_name.to_string(),
            label_selector: self.config.agent_label.clone(),
        };

        let pods = self
            .lister
            .list_pods(&query)
            .await
            .map_err(|source| ProxyError::Discovery {
                node: node_name.to_string(),
                source,
            })?;

        let chosen = pods
            .iter()
            .filter(|pod| pod.name.contains(&self.config.agent_name_filter))
            .filter_map(|pod| pod.pod_ip.parse::<IpAddr>().ok().map(|ip| (pod, ip)))
            .min_by(|(a, _), (b, _)| a.name.cmp(&b.name));

        match chosen {
            Some((pod, ip)) => {
                debug!(node = %node_name, pod = %pod.name, %ip, candidates = pods.len(), "resolved mesh agent");
                Ok(ip)
            }
            None => Err(ProxyError::AgentNotFound {
                node: node_name.to_string(),
            }),
        }
    }
}

/// In-memory pod table evaluating queries the way the cluster API does.
///
/// Backs the binary when pods are declared in configuration, and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticPodLister {
    pods: Vec<PodInfo>,
}

impl StaticPodLister {
    pub fn new(pods: Vec<PodInfo>) -> Self {
        Self { pods }
    }

    pub fn len(&self) -> usize {
        self.pods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pods.is_empty()
    }
}

#[async_trait]
impl PodLister for StaticPodLister {
    async fn list_pods(&self, query: &PodQuery) -> std::result::Result<Vec<PodInfo>, BoxError> {
        Ok(self
            .pods
            .iter()
            .filter(|pod| pod.namespace == query.namespace)
            .filter(|pod| pod.node_name == query.node_name)
            .filter(|pod| query.label_selector.matches(&pod.labels))
            .cloned()
            .collect())
    }
}
