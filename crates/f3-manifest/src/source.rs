//! Manifest Sources
//!
//! Where the watcher fetches candidate manifests from. The RPC source asks the
//! node over its JSON-RPC Unix socket; tests plug in scripted sources.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use f3_manifest_protocol::{JsonRpcRequest, SocketClient};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::WatcherConfig;
use crate::error::SourceError;
use crate::manifest::{Manifest, ManifestDocument};

/// Fetch capability polled by [`crate::ManifestWatcher`].
///
/// `Ok(None)` means the source has no manifest to offer right now.
/// Implementations should honour `cancel` so shutdown is not held up by a
/// slow fetch.
#[async_trait]
pub trait ManifestSource<M: ManifestDocument>: Send + Sync + 'static {
    async fn get_manifest(&self, cancel: &CancellationToken) -> Result<Option<M>, SourceError>;
}

/// Reads the manifest published by the on-chain contract through the node's
/// JSON-RPC socket.
#[derive(Debug, Clone)]
pub struct RpcManifestSource {
    socket_path: PathBuf,
    method: String,
    timeout: Duration,
}

impl RpcManifestSource {
    pub fn new(socket_path: impl Into<PathBuf>, method: impl Into<String>, timeout: Duration) -> Self {
        Self {
            socket_path: socket_path.into(),
            method: method.into(),
            timeout,
        }
    }

    pub fn from_config(config: &WatcherConfig) -> Self {
        Self::new(
            config.socket_path.clone(),
            config.rpc_method.clone(),
            config.request_timeout(),
        )
    }

    pub fn socket_path(&self) -> &PathBuf {
        &self.socket_path
    }

    async fn fetch(&self) -> Result<Option<Manifest>, SourceError> {
        let mut client = SocketClient::connect_to(self.socket_path.clone()).await?;
        let request = JsonRpcRequest::new(self.method.clone(), Value::Array(Vec::new()));
        debug!(method = %self.method, "Requesting manifest");

        let result = client.call(request).await?.into_result()?;
        if result.is_null() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_value(result)?))
    }
}

#[async_trait]
impl ManifestSource<Manifest> for RpcManifestSource {
    async fn get_manifest(&self, cancel: &CancellationToken) -> Result<Option<Manifest>, SourceError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(SourceError::Cancelled),
            res = tokio::time::timeout(self.timeout, self.fetch()) => {
                res.map_err(|_| SourceError::Timeout(self.timeout))?
            }
        }
    }
}
