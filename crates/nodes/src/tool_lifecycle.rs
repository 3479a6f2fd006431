//! Scoped ownership of the external-tool connection for one run.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use pipeline::tools::{ConnectionParams, ToolBridge, ToolConnector, ToolError, ToolServerConfig};

/// Opens one tool channel per invocation and always closes it.
#[derive(Clone)]
pub struct ToolLifecycleManager {
    connector: Arc<dyn ToolConnector>,
    params: ConnectionParams,
}

impl ToolLifecycleManager {
    pub fn new(connector: Arc<dyn ToolConnector>, params: ConnectionParams) -> Self {
        Self { connector, params }
    }

    /// Resolves `config` against `root` and builds a manager.
    pub fn from_config(
        connector: Arc<dyn ToolConnector>,
        config: &ToolServerConfig,
        root: &Path,
    ) -> Result<Self, ToolError> {
        Ok(Self::new(connector, config.resolve(root)?))
    }

    pub fn params(&self) -> &ConnectionParams {
        &self.params
    }

    /// Opens the channel, runs `body` with a bridge over it, then closes it.
    ///
    /// Returns `Err` only when the channel could not be opened, in which case
    /// `body` never runs. A failed close is logged; the body's output is still
    /// returned.
    pub async fn scoped<F, Fut, T>(&self, body: F) -> Result<T, ToolError>
    where
        F: FnOnce(ToolBridge) -> Fut,
        Fut: Future<Output = T>,
    {
        let channel = self.connector.connect(&self.params).await?;
        tracing::debug!(params = ?self.params, "tool channel opened");
        let output = body(ToolBridge::new(channel.clone())).await;
        match channel.close().await {
            Ok(()) => tracing::debug!("tool channel closed"),
            Err(e) => tracing::warn!(error = %e, "tool channel did not close cleanly"),
        }
        Ok(output)
    }
}
