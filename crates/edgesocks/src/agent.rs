//! Turns settings into a runnable proxy.

use std::net::SocketAddr;
use std::path::Path;

use edgesocks_proxy::{
    DirectTransport, PodInfo, ProxyConfig, ResolverConfig, StaticPodLister, Timeouts,
};
use edgesocks_settings::{AgentConfig, ConfigLoader, NODE_NAME_ENV};

use crate::cli::ConfigSource;
use crate::error::CliError;

/// Load the effective configuration.
///
/// `--no-config` skips the global and project files but `--config <extra>`
/// still applies. `$NODE_NAME` fills in the node name when no file sets it.
pub fn load_config(source: &ConfigSource, cwd: &Path) -> Result<AgentConfig, CliError> {
    let mut config = match (&source.extra_config, source.no_config) {
        (Some(extra), false) => ConfigLoader::load_with(cwd, extra)?,
        (Some(extra), true) => AgentConfig::load(extra)?,
        (None, false) => ConfigLoader::load(cwd),
        (None, true) => AgentConfig::default(),
    };
    config.apply_node_name_fallback(std::env::var(NODE_NAME_ENV).ok());
    Ok(config)
}

/// Build the server configuration from validated settings.
///
/// The agent label is parsed here, by the same selector grammar the
/// resolver matches with.
pub fn proxy_config(config: &AgentConfig) -> Result<ProxyConfig, CliError> {
    let node_name = config
        .node_name()
        .ok_or_else(|| CliError::Other("node name is not set".to_string()))?;
    let bind_addr = SocketAddr::new(config.listen_ip()?, config.socks5.listen_port());

    Ok(ProxyConfig {
        bind_addr,
        node_name: node_name.to_string(),
        resolver: ResolverConfig {
            namespace: config.discovery.namespace().to_string(),
            agent_label: config.discovery.agent_label().parse()?,
            agent_name_filter: config.discovery.agent_name_filter().to_string(),
        },
        timeouts: Timeouts {
            handshake: config.timeouts.handshake(),
            resolve: config.timeouts.resolve(),
            tunnel: config.timeouts.tunnel(),
            relay_idle: config.timeouts.relay_idle(),
        },
        max_connections: config.socks5.max_connections(),
        reply_on_failure: config.socks5.reply_on_failure(),
        shutdown_grace: config.timeouts.shutdown_grace(),
    })
}

/// Pod table from `[[discovery.pods]]`.
pub fn pod_lister(config: &AgentConfig) -> StaticPodLister {
    let namespace = config.discovery.namespace();
    StaticPodLister::new(
        config
            .discovery
            .pods
            .iter()
            .map(|pod| PodInfo {
                name: pod.name.clone(),
                namespace: pod.namespace.as_deref().unwrap_or(namespace).to_string(),
                node_name: pod.node_name.clone(),
                labels: pod.labels.clone(),
                pod_ip: pod.pod_ip.clone(),
            })
            .collect(),
    )
}

pub fn transport(config: &AgentConfig) -> DirectTransport {
    DirectTransport {
        dial_timeout: config.timeouts.dial(),
    }
}
