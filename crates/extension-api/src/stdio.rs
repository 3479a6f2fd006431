//! Tool channel over a child process's stdio, one JSON object per line.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use pipeline::tools::{ToolChannel, ToolEnvelope, ToolError};
use pipeline::ToolName;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;

use crate::rpc::{self, Request, RequestIds, Response};

/// A spawned tool server.
///
/// The child is killed on [`ToolChannel::close`] and, failing that, when the
/// channel is dropped.
#[derive(Debug)]
pub struct StdioChannel {
    program: String,
    child: Mutex<Option<Child>>,
    writer: Mutex<ChildStdin>,
    reader: Mutex<BufReader<ChildStdout>>,
    ids: RequestIds,
    call_timeout: Duration,
    closed: AtomicBool,
}

impl StdioChannel {
    /// Spawns `command` and performs the `initialize` handshake.
    pub async fn spawn(
        command: &str,
        args: &[String],
        cwd: Option<&Path>,
        env: &BTreeMap<String, String>,
        init_timeout: Duration,
        call_timeout: Duration,
    ) -> Result<Self, ToolError> {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }
        let mut child = cmd.spawn().map_err(|e| ToolError::Connection {
            message: format!("failed to start '{command}': {e}"),
        })?;
        let stdin = child.stdin.take().ok_or_else(|| ToolError::Connection {
            message: format!("'{command}' has no stdin"),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| ToolError::Connection {
            message: format!("'{command}' has no stdout"),
        })?;

        let channel = Self {
            program: command.to_string(),
            child: Mutex::new(Some(child)),
            writer: Mutex::new(stdin),
            reader: Mutex::new(BufReader::new(stdout)),
            ids: RequestIds::new(),
            call_timeout,
            closed: AtomicBool::new(false),
        };
        match tokio::time::timeout(init_timeout, channel.initialize()).await {
            Ok(Ok(())) => {
                tracing::debug!(program = %channel.program, "tool server initialized");
                Ok(channel)
            }
            Ok(Err(e)) => {
                let _ = channel.close().await;
                Err(ToolError::Connection {
                    message: format!("'{command}' failed to initialize: {e}"),
                })
            }
            Err(_) => {
                let _ = channel.close().await;
                Err(ToolError::Connection {
                    message: format!("'{command}' did not initialize within {init_timeout:?}"),
                })
            }
        }
    }

    async fn initialize(&self) -> Result<(), String> {
        let response = self
            .request("initialize", rpc::initialize_params())
            .await
            .map_err(|e| e.to_string())?;
        if let Some(error) = response.error {
            return Err(error.message);
        }
        self.write(&Request::notification("notifications/initialized"))
            .await
            .map_err(|e| e.to_string())
    }

    async fn write(&self, request: &Request<'_>) -> std::io::Result<()> {
        let mut line = serde_json::to_string(request).map_err(std::io::Error::other)?;
        line.push('\n');
        let mut writer = self.writer.lock().await;
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await
    }

    /// Writes one request and reads lines until the matching response.
    async fn request(&self, method: &str, params: Value) -> std::io::Result<Response> {
        let id = self.ids.next();
        self.write(&Request::call(id, method, params)).await?;

        let mut reader = self.reader.lock().await;
        let mut line = String::new();
        loop {
            line.clear();
            if reader.read_line(&mut line).await? == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "tool server closed its stdout",
                ));
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<Response>(trimmed) {
                Ok(response) if response.id == Some(id) => return Ok(response),
                // Notifications, stale responses and log lines.
                _ => tracing::trace!(line = %trimmed, "ignoring tool server output"),
            }
        }
    }
}

#[async_trait]
impl ToolChannel for StdioChannel {
    async fn call_tool(&self, tool: &ToolName, args: Value) -> Result<ToolEnvelope, ToolError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ToolError::Closed);
        }
        let call = self.request("tools/call", rpc::call_params(tool, args));
        let response = match tokio::time::timeout(self.call_timeout, call).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                return Err(ToolError::Transport {
                    tool: tool.clone(),
                    message: e.to_string(),
                })
            }
            Err(_) => {
                return Err(ToolError::Transport {
                    tool: tool.clone(),
                    message: format!("no response within {:?}", self.call_timeout),
                })
            }
        };
        rpc::into_envelope(tool, response)
    }

    async fn close(&self) -> Result<(), ToolError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let Some(mut child) = self.child.lock().await.take() else {
            return Ok(());
        };
        match child.kill().await {
            Ok(()) => {
                tracing::debug!(program = %self.program, "tool server stopped");
                Ok(())
            }
            Err(e) => Err(ToolError::Connection {
                message: format!("failed to stop '{}': {e}", self.program),
            }),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;

    /// A server that answers `initialize` (id 1) and one `tools/call` (id 2).
    const FAKE_SERVER: &str = r#"
read -r init
printf '%s\n' 'server starting'
printf '%s\n' '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2024-11-05","capabilities":{}}}'
read -r initialized
read -r call
printf '%s\n' '{"jsonrpc":"2.0","method":"notifications/progress"}'
printf '%s\n' '{"jsonrpc":"2.0","id":2,"result":{"content":[{"type":"text","text":"{\"passed\":true}"}],"isError":false}}'
read -r rest
"#;

    async fn spawn(script: &str) -> Result<StdioChannel, ToolError> {
        StdioChannel::spawn(
            "sh",
            &["-c".to_string(), script.to_string()],
            None,
            &BTreeMap::new(),
            Duration::from_secs(5),
            Duration::from_secs(5),
        )
        .await
    }

    #[tokio::test]
    async fn call_skips_noise_and_returns_the_matching_response() {
        let channel = spawn(FAKE_SERVER).await.unwrap();
        let tool = ToolName::new("citation_verify").unwrap();

        let envelope = channel.call_tool(&tool, json!({"citations": []})).await.unwrap();

        assert!(!envelope.is_error);
        let text = assert_matches!(envelope.content.as_slice(), [block] => block.text.clone().unwrap());
        assert_eq!(serde_json::from_str::<Value>(&text).unwrap(), json!({"passed": true}));
        channel.close().await.unwrap();
        channel.close().await.unwrap();
        assert_matches!(channel.call_tool(&tool, json!({})).await, Err(ToolError::Closed));
    }

    #[tokio::test]
    async fn missing_program_is_a_connection_failure() {
        let result = StdioChannel::spawn(
            "/nonexistent/tool-server",
            &[],
            None,
            &BTreeMap::new(),
            Duration::from_secs(1),
            Duration::from_secs(1),
        )
        .await;
        assert_matches!(result, Err(ToolError::Connection { .. }));
    }

    #[tokio::test]
    async fn server_exiting_during_handshake_is_a_connection_failure() {
        assert_matches!(spawn("exit 0").await, Err(ToolError::Connection { .. }));
    }
}
