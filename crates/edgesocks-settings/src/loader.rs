//! Layered configuration loading.
//!
//! Loads and merges configuration from two locations:
//! 1. Global: `~/.config/edgesocks/agent.toml`
//! 2. Project: `<dir>/.edgesocks/agent.toml`
//!
//! Project values take precedence for scalar fields; static pod lists are
//! extended so that both global and project entries contribute.

use crate::{AgentConfig, SettingsError};
use std::path::{Path, PathBuf};

const CONFIG_FILE: &str = "agent.toml";

/// Loads and merges `AgentConfig` from global and project-level files.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load the merged configuration for the given directory.
    ///
    /// Missing files are silently skipped. Parse errors emit a warning to
    /// stderr and the file is treated as if absent.
    pub fn load(dir: &Path) -> AgentConfig {
        let global = Self::load_optional(&Self::global_config_path());
        let project = Self::load_optional(&Self::project_config_path(dir));
        global.merge(project)
    }

    /// Like [`ConfigLoader::load`], with an explicit file layered on top.
    ///
    /// Unlike the layered files, the explicit file must exist and parse.
    ///
    /// # Errors
    /// Returns `SettingsError::Io` or `SettingsError::ParseError` for `extra`.
    pub fn load_with(dir: &Path, extra: &Path) -> Result<AgentConfig, SettingsError> {
        let extra = AgentConfig::load(extra)?;
        Ok(Self::load(dir).merge(extra))
    }

    /// Absolute path to the global config file.
    pub fn global_config_path() -> PathBuf {
        Self::global_config_dir()
            .unwrap_or_else(|| PathBuf::from(".edgesocks"))
            .join(CONFIG_FILE)
    }

    /// Path to the project config file for the given directory.
    pub fn project_config_path(dir: &Path) -> PathBuf {
        dir.join(".edgesocks").join(CONFIG_FILE)
    }

    fn global_config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("edgesocks"))
    }

    fn load_optional(path: &Path) -> AgentConfig {
        if !path.exists() {
            return AgentConfig::default();
        }
        match AgentConfig::load(path) {
            Ok(config) => config,
            Err(err) => {
                // Warn but don't fail: a malformed config shouldn't block startup.
                eprintln!("edgesocks-settings: warning: failed to parse {path:?}: {err}");
                AgentConfig::default()
            }
        }
    }
}
