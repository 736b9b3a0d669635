//! Configuration management
//!
//! Watcher settings read from `~/.f3/manifest-watcher.json`. Every field is
//! optional in the file; missing ones fall back to the defaults below.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ConfigError;
use crate::manifest::Manifest;

pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 900;
pub const DEFAULT_RPC_METHOD: &str = "F3.GetManifestFromContract";
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

fn f3_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".f3"))
}

/// Path of the config file loaded by [`WatcherConfig::load_or_default`]
pub fn default_config_path() -> Result<PathBuf, ConfigError> {
    f3_dir()
        .map(|dir| dir.join("manifest-watcher.json"))
        .ok_or(ConfigError::HomeDirUnavailable)
}

fn default_socket_path() -> PathBuf {
    f3_manifest_protocol::default_socket_path().unwrap_or_else(|| PathBuf::from("f3.sock"))
}

fn default_poll_interval_secs() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}

fn default_rpc_method() -> String {
    DEFAULT_RPC_METHOD.to_string()
}

fn default_request_timeout_secs() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatcherConfig {
    /// Seconds between polls of the manifest source
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Node JSON-RPC socket
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,

    #[serde(default = "default_rpc_method")]
    pub rpc_method: String,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Statically shipped manifest, used to seed the fallback power table
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed_manifest: Option<PathBuf>,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            socket_path: default_socket_path(),
            rpc_method: default_rpc_method(),
            request_timeout_secs: default_request_timeout_secs(),
            seed_manifest: None,
        }
    }
}

impl WatcherConfig {
    /// Read a config file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = serde_json::from_str(&content)?;
        info!("Loaded watcher config from {:?}", path);
        Ok(config)
    }

    /// Read the default config file, or defaults when it does not exist
    pub fn load_or_default() -> Result<Self, ConfigError> {
        let path = default_config_path()?;
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::load(&path)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Parse the seed manifest, if one is configured
    pub fn load_seed_manifest(&self) -> Result<Option<Manifest>, ConfigError> {
        let Some(path) = &self.seed_manifest else {
            return Ok(None);
        };
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        Ok(Some(serde_json::from_str(&content)?))
    }
}
