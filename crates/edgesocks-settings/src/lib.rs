//! Layered TOML configuration for the edgesocks agent.
//!
//! Loads from:
//! - Global config: `~/.config/edgesocks/agent.toml`
//! - Project config: `<dir>/.edgesocks/agent.toml`
//!
//! Project values take precedence for scalar fields; list fields are merged.
//!
//! # Example
//!
//! ```no_run
//! use edgesocks_settings::ConfigLoader;
//!
//! let config = ConfigLoader::load(std::path::Path::new("."));
//! println!("{}", config.socks5.listen_port());
//! ```

mod loader;

pub use loader::ConfigLoader;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_LISTEN_IP: &str = "127.0.0.1";
pub const DEFAULT_LISTEN_PORT: u16 = 10800;
pub const DEFAULT_MAX_CONNECTIONS: usize = 1024;
pub const DEFAULT_NAMESPACE: &str = "kubeedge";
pub const DEFAULT_AGENT_LABEL: &str = "kubeedge=edgemesh-agent";
pub const DEFAULT_AGENT_NAME_FILTER: &str = "edgemesh-agent";

/// Environment variable that supplies the node name when the config does not.
pub const NODE_NAME_ENV: &str = "NODE_NAME";

/// Errors from settings operations.
#[derive(Error, Debug)]
pub enum SettingsError {
    /// TOML deserialization failed.
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// TOML serialization failed.
    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),

    /// I/O error reading or writing a config file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Config parsed but cannot be used.
    #[error("Invalid config: {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl SettingsError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// TOML `[socks5]` section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Socks5Settings {
    /// Whether `edgesocks run` starts the proxy at all.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listen_ip: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listen_port: Option<u16>,

    /// Node this agent runs on. Falls back to `$NODE_NAME`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<usize>,

    /// Send SOCKS5 failure replies instead of closing silently.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_on_failure: Option<bool>,
}

impl Socks5Settings {
    pub fn enabled(&self) -> bool {
        self.enable.unwrap_or(true)
    }

    pub fn listen_ip(&self) -> &str {
        self.listen_ip.as_deref().unwrap_or(DEFAULT_LISTEN_IP)
    }

    pub fn listen_port(&self) -> u16 {
        self.listen_port.unwrap_or(DEFAULT_LISTEN_PORT)
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections.unwrap_or(DEFAULT_MAX_CONNECTIONS)
    }

    pub fn reply_on_failure(&self) -> bool {
        self.reply_on_failure.unwrap_or(false)
    }
}

/// A pod declared in configuration, for clusters without a live API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StaticPod {
    pub name: String,
    pub node_name: String,
    pub pod_ip: String,

    /// Default: the `[discovery]` namespace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// TOML `[discovery]` section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DiscoverySettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Equality selector, `key=value[,key=value...]`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_label: Option<String>,

    /// Substring every agent pod name contains.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_name_filter: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pods: Vec<StaticPod>,
}

impl DiscoverySettings {
    pub fn namespace(&self) -> &str {
        self.namespace.as_deref().unwrap_or(DEFAULT_NAMESPACE)
    }

    pub fn agent_label(&self) -> &str {
        self.agent_label.as_deref().unwrap_or(DEFAULT_AGENT_LABEL)
    }

    pub fn agent_name_filter(&self) -> &str {
        self.agent_name_filter
            .as_deref()
            .unwrap_or(DEFAULT_AGENT_NAME_FILTER)
    }
}

/// TOML `[timeouts]` section, all in seconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimeoutSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handshake_secs: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolve_secs: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tunnel_secs: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dial_secs: Option<u64>,

    /// Close a relay after this long without traffic either way.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relay_idle_secs: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shutdown_grace_secs: Option<u64>,
}

impl TimeoutSettings {
    pub fn handshake(&self) -> Duration {
        Duration::from_secs(self.handshake_secs.unwrap_or(10))
    }

    pub fn resolve(&self) -> Duration {
        Duration::from_secs(self.resolve_secs.unwrap_or(5))
    }

    pub fn tunnel(&self) -> Duration {
        Duration::from_secs(self.tunnel_secs.unwrap_or(10))
    }

    pub fn dial(&self) -> Duration {
        Duration::from_secs(self.dial_secs.unwrap_or(10))
    }

    pub fn relay_idle(&self) -> Duration {
        Duration::from_secs(self.relay_idle_secs.unwrap_or(300))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs.unwrap_or(5))
    }
}

/// Top-level agent configuration, corresponding to `agent.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    #[serde(default)]
    pub socks5: Socks5Settings,

    #[serde(default)]
    pub discovery: DiscoverySettings,

    #[serde(default)]
    pub timeouts: TimeoutSettings,
}

impl AgentConfig {
    /// Parse an `AgentConfig` from a TOML string.
    ///
    /// # Errors
    /// Returns `SettingsError::ParseError` if the TOML is malformed or
    /// contains unrecognised keys for this schema.
    pub fn parse(toml: &str) -> Result<Self, SettingsError> {
        toml::from_str(toml).map_err(SettingsError::ParseError)
    }

    /// Load an `AgentConfig` from a file on disk.
    ///
    /// # Errors
    /// Returns `SettingsError::Io` on read failure, or
    /// `SettingsError::ParseError` if the file content is not valid TOML.
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Serialize this config to a TOML string.
    ///
    /// # Errors
    /// Returns `SettingsError::SerializeError` if serialization fails.
    pub fn to_toml(&self) -> Result<String, SettingsError> {
        toml::to_string_pretty(self).map_err(SettingsError::SerializeError)
    }

    /// Save this config to a file, creating parent directories as needed.
    ///
    /// # Errors
    /// Returns `SettingsError::Io` on write failure, or
    /// `SettingsError::SerializeError` if serialization fails.
    pub fn save(&self, path: &Path) -> Result<(), SettingsError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = self.to_toml()?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Starter config written by `edgesocks config init`.
    pub fn starter() -> Self {
        Self {
            socks5: Socks5Settings {
                enable: Some(true),
                listen_ip: Some(DEFAULT_LISTEN_IP.to_string()),
                listen_port: Some(DEFAULT_LISTEN_PORT),
                ..Default::default()
            },
            discovery: DiscoverySettings {
                namespace: Some(DEFAULT_NAMESPACE.to_string()),
                agent_label: Some(DEFAULT_AGENT_LABEL.to_string()),
                agent_name_filter: Some(DEFAULT_AGENT_NAME_FILTER.to_string()),
                pods: vec![],
            },
            timeouts: TimeoutSettings::default(),
        }
    }

    /// Merge `other` (project-level) on top of `self` (global-level).
    ///
    /// - Scalar fields: `other` wins when explicitly set (`Some`).
    /// - `discovery.pods`: extended with `other`'s entries; a later entry
    ///   with the same pod name replaces the earlier one.
    #[must_use]
    pub fn merge(mut self, other: AgentConfig) -> AgentConfig {
        let s = other.socks5;
        overlay(&mut self.socks5.enable, s.enable);
        overlay(&mut self.socks5.listen_ip, s.listen_ip);
        overlay(&mut self.socks5.listen_port, s.listen_port);
        overlay(&mut self.socks5.node_name, s.node_name);
        overlay(&mut self.socks5.max_connections, s.max_connections);
        overlay(&mut self.socks5.reply_on_failure, s.reply_on_failure);

        let d = other.discovery;
        overlay(&mut self.discovery.namespace, d.namespace);
        overlay(&mut self.discovery.agent_label, d.agent_label);
        overlay(&mut self.discovery.agent_name_filter, d.agent_name_filter);
        self.discovery.pods.extend(d.pods);
        dedup_pods_keep_last(&mut self.discovery.pods);

        let t = other.timeouts;
        overlay(&mut self.timeouts.handshake_secs, t.handshake_secs);
        overlay(&mut self.timeouts.resolve_secs, t.resolve_secs);
        overlay(&mut self.timeouts.tunnel_secs, t.tunnel_secs);
        overlay(&mut self.timeouts.dial_secs, t.dial_secs);
        overlay(&mut self.timeouts.relay_idle_secs, t.relay_idle_secs);
        overlay(&mut self.timeouts.shutdown_grace_secs, t.shutdown_grace_secs);
        self
    }

    /// Fill `socks5.node_name` from `value` when the config leaves it unset.
    pub fn apply_node_name_fallback(&mut self, value: Option<String>) {
        if self.socks5.node_name.is_none() {
            self.socks5.node_name = value.filter(|v| !v.trim().is_empty());
        }
    }

    /// Effective node name, if any.
    pub fn node_name(&self) -> Option<&str> {
        self.socks5.node_name.as_deref()
    }

    /// Check that the config describes a runnable agent.
    ///
    /// # Errors
    /// Returns `SettingsError::Invalid` naming the first offending field.
    pub fn validate(&self) -> Result<(), SettingsError> {
        match self.node_name() {
            Some(name) if !name.trim().is_empty() => {}
            _ => {
                return Err(SettingsError::invalid(
                    "socks5.node_name",
                    format!("not set (use the config file, --node-name or ${NODE_NAME_ENV})"),
                ))
            }
        }
        if self.socks5.listen_port() == 0 {
            return Err(SettingsError::invalid("socks5.listen_port", "must not be 0"));
        }
        self.listen_ip()?;
        if self.socks5.max_connections() == 0 {
            return Err(SettingsError::invalid(
                "socks5.max_connections",
                "must be at least 1",
            ));
        }
        let timeouts = &self.timeouts;
        for (field, value) in [
            ("timeouts.handshake_secs", timeouts.handshake()),
            ("timeouts.resolve_secs", timeouts.resolve()),
            ("timeouts.tunnel_secs", timeouts.tunnel()),
            ("timeouts.dial_secs", timeouts.dial()),
            ("timeouts.relay_idle_secs", timeouts.relay_idle()),
        ] {
            if value.is_zero() {
                return Err(SettingsError::invalid(field, "must not be 0"));
            }
        }
        for pod in &self.discovery.pods {
            if pod.name.trim().is_empty() || pod.node_name.trim().is_empty() {
                return Err(SettingsError::invalid(
                    "discovery.pods",
                    "every pod needs a name and a node_name",
                ));
            }
        }
        Ok(())
    }

    /// Parsed listen IP.
    ///
    /// # Errors
    /// Returns `SettingsError::Invalid` if `socks5.listen_ip` is not an IP.
    pub fn listen_ip(&self) -> Result<IpAddr, SettingsError> {
        let raw = self.socks5.listen_ip();
        raw.parse()
            .map_err(|_| SettingsError::invalid("socks5.listen_ip", format!("{raw:?} is not an IP address")))
    }
}

fn overlay<T>(base: &mut Option<T>, top: Option<T>) {
    if top.is_some() {
        *base = top;
    }
}

/// Keep one entry per pod name, the last one seen, in first-seen order.
fn dedup_pods_keep_last(pods: &mut Vec<StaticPod>) {
    let mut merged: Vec<StaticPod> = Vec::with_capacity(pods.len());
    for pod in pods.drain(..) {
        match merged.iter_mut().find(|p| p.name == pod.name) {
            Some(existing) => *existing = pod,
            None => merged.push(pod),
        }
    }
    *pods = merged;
}
