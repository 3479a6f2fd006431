//! [`ToolConnector`] selecting the transport from the connection parameters.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pipeline::tools::{ConnectionParams, ToolChannel, ToolConnector, ToolError};
use serde::{Deserialize, Serialize};

use crate::http::HttpChannel;
use crate::stdio::StdioChannel;

/// Timeouts applied to every channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelTimeouts {
    pub initialize_secs: u64,
    pub call_secs: u64,
}

impl Default for ChannelTimeouts {
    fn default() -> Self {
        Self {
            initialize_secs: 30,
            call_secs: 120,
        }
    }
}

/// Opens stdio or HTTP tool channels.
#[derive(Debug, Clone, Default)]
pub struct ExtensionConnector {
    timeouts: ChannelTimeouts,
}

impl ExtensionConnector {
    pub fn new(timeouts: ChannelTimeouts) -> Self {
        Self { timeouts }
    }
}

#[async_trait]
impl ToolConnector for ExtensionConnector {
    #[tracing::instrument(skip_all)]
    async fn connect(&self, params: &ConnectionParams) -> Result<Arc<dyn ToolChannel>, ToolError> {
        let init = Duration::from_secs(self.timeouts.initialize_secs);
        let call = Duration::from_secs(self.timeouts.call_secs);
        match params {
            ConnectionParams::Stdio { command, args, cwd, env } => {
                tracing::info!(command = %command, "starting tool server");
                let channel = StdioChannel::spawn(command, args, cwd.as_deref(), env, init, call).await?;
                Ok(Arc::new(channel))
            }
            ConnectionParams::Http { url } => {
                tracing::info!(url = %url, "connecting to tool server");
                let channel = HttpChannel::connect(url, call.max(init)).await?;
                Ok(Arc::new(channel))
            }
        }
    }
}
