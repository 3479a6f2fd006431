//! External-tool port and the typed bridge over it.
//!
//! A [`ToolChannel`] is one open connection to an external tool server. Every
//! call returns a raw [`ToolEnvelope`] (`{content: [{type, text}], isError}`).
//! [`ToolBridge`] is the only consumer of envelopes: it unwraps the text
//! blocks, parses the embedded JSON payload, validates it against an
//! [`OutputSchema`], and names the tool in every error. Stage logic only sees
//! validated values.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::extract::OutputSchema;
use crate::{RetryPolicy, ToolName};

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// One content block of a tool response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentBlock {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl ContentBlock {
    /// A `text` block.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: "text".to_string(),
            text: Some(text.into()),
        }
    }
}

/// Raw response of one tool call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolEnvelope {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
    #[serde(default, rename = "isError")]
    pub is_error: bool,
}

impl ToolEnvelope {
    /// A successful envelope carrying `payload` as one JSON text block.
    pub fn json(payload: &Value) -> Self {
        Self {
            content: vec![ContentBlock::text(payload.to_string())],
            is_error: false,
        }
    }

    /// An error envelope carrying `message`.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            content: vec![ContentBlock::text(message)],
            is_error: true,
        }
    }

    /// Concatenated text of every `text` block.
    fn text(&self) -> String {
        self.content
            .iter()
            .filter(|b| b.kind == "text")
            .filter_map(|b| b.text.as_deref())
            .collect::<Vec<_>>()
            .join("")
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failures at the tool boundary.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ToolError {
    /// The channel could not be opened.
    #[error("could not connect to tool server: {message}")]
    Connection { message: String },

    /// The request or response failed in transit.
    #[error("tool '{tool}' transport failed: {message}")]
    Transport { tool: ToolName, message: String },

    /// The tool reported an error in its envelope.
    #[error("tool '{tool}' reported an error: {message}")]
    Reported { tool: ToolName, message: String },

    /// The envelope carried no text content.
    #[error("tool '{tool}' returned an empty response")]
    EmptyResponse { tool: ToolName },

    /// The text content was not JSON.
    #[error("tool '{tool}' returned invalid JSON: {message}")]
    InvalidPayload { tool: ToolName, message: String },

    /// The payload did not match the expected schema or type.
    #[error("tool '{tool}' returned an unexpected shape: {message}")]
    SchemaMismatch { tool: ToolName, message: String },

    /// The channel was used after it was closed.
    #[error("tool channel is closed")]
    Closed,
}

impl ToolError {
    /// Transport failures may be retried; everything else may not.
    pub fn retry_policy(&self) -> RetryPolicy {
        match self {
            Self::Transport { .. } | Self::Connection { .. } => RetryPolicy::Retryable { after: None },
            _ => RetryPolicy::NonRetryable,
        }
    }

    /// The tool the error concerns, if any.
    pub fn tool(&self) -> Option<&ToolName> {
        match self {
            Self::Transport { tool, .. }
            | Self::Reported { tool, .. }
            | Self::EmptyResponse { tool }
            | Self::InvalidPayload { tool, .. }
            | Self::SchemaMismatch { tool, .. } => Some(tool),
            Self::Connection { .. } | Self::Closed => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Ports
// ---------------------------------------------------------------------------

/// One open connection to an external tool server.
#[async_trait]
pub trait ToolChannel: Send + Sync {
    /// Invokes `tool` with `args` and returns the raw envelope.
    async fn call_tool(&self, tool: &ToolName, args: Value) -> Result<ToolEnvelope, ToolError>;

    /// Closes the connection. Must be idempotent.
    async fn close(&self) -> Result<(), ToolError>;
}

/// Opens [`ToolChannel`]s.
#[async_trait]
pub trait ToolConnector: Send + Sync {
    /// Opens one channel using `params`.
    async fn connect(&self, params: &ConnectionParams) -> Result<Arc<dyn ToolChannel>, ToolError>;
}

// ---------------------------------------------------------------------------
// Connection parameters
// ---------------------------------------------------------------------------

/// Tool server configuration as written by the user.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolServerConfig {
    /// Executable to spawn. Ignored when `url` is set.
    pub command: String,
    pub args: Vec<String>,
    /// Working directory for the child process.
    pub cwd: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    /// HTTP endpoint; selects the HTTP transport when present.
    pub url: Option<String>,
}

/// Fully resolved connection parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionParams {
    /// Spawn a child process and speak over its stdio.
    Stdio {
        command: String,
        args: Vec<String>,
        cwd: Option<PathBuf>,
        env: BTreeMap<String, String>,
    },
    /// POST requests to an HTTP endpoint.
    Http { url: String },
}

impl ToolServerConfig {
    /// Resolves relative, path-like values against `root`.
    ///
    /// A bare executable name (`uvx`, `python3`) is left untouched so the
    /// operating system's `PATH` lookup applies; `./server` or `bin/server`
    /// become `root/./server` and `root/bin/server`.
    pub fn resolve(&self, root: &Path) -> Result<ConnectionParams, ToolError> {
        if let Some(url) = self.url.as_deref().map(str::trim).filter(|u| !u.is_empty()) {
            return Ok(ConnectionParams::Http { url: url.to_string() });
        }
        let command = self.command.trim();
        if command.is_empty() {
            return Err(ToolError::Connection {
                message: "tool server has neither a command nor a url".to_string(),
            });
        }
        let command = if is_path_like(command) && Path::new(command).is_relative() {
            root.join(command).to_string_lossy().into_owned()
        } else {
            command.to_string()
        };
        let cwd = self.cwd.as_ref().map(|dir| {
            if dir.is_relative() {
                root.join(dir)
            } else {
                dir.clone()
            }
        });
        Ok(ConnectionParams::Stdio {
            command,
            args: self.args.clone(),
            cwd,
            env: self.env.clone(),
        })
    }
}

/// `true` if `value` names a file location rather than a bare program name.
pub fn is_path_like(value: &str) -> bool {
    value.contains('/') || value.contains('\\') || value.starts_with('.')
}

// ---------------------------------------------------------------------------
// Bridge
// ---------------------------------------------------------------------------

/// Typed wrapper over one open [`ToolChannel`].
#[derive(Clone)]
pub struct ToolBridge {
    channel: Arc<dyn ToolChannel>,
}

impl ToolBridge {
    pub fn new(channel: Arc<dyn ToolChannel>) -> Self {
        Self { channel }
    }

    /// Calls `tool` and returns its validated JSON payload.
    #[tracing::instrument(skip(self, args, schema), fields(tool = %tool))]
    pub async fn call_value(&self, tool: &ToolName, args: Value, schema: &OutputSchema) -> Result<Value, ToolError> {
        let envelope = self.channel.call_tool(tool, args).await?;
        let payload = unwrap_envelope(tool, &envelope)?;
        schema.validate(&payload).map_err(|message| ToolError::SchemaMismatch {
            tool: tool.clone(),
            message,
        })?;
        Ok(payload)
    }

    /// Calls `tool`, validates against `schema`, and deserialises into `T`.
    pub async fn call<T: DeserializeOwned>(
        &self,
        tool: &ToolName,
        args: Value,
        schema: &OutputSchema,
    ) -> Result<T, ToolError> {
        let payload = self.call_value(tool, args, schema).await?;
        serde_json::from_value(payload).map_err(|e| ToolError::SchemaMismatch {
            tool: tool.clone(),
            message: e.to_string(),
        })
    }
}

fn unwrap_envelope(tool: &ToolName, envelope: &ToolEnvelope) -> Result<Value, ToolError> {
    let text = envelope.text();
    if envelope.is_error {
        let message = if text.trim().is_empty() {
            "no detail given".to_string()
        } else {
            text
        };
        return Err(ToolError::Reported {
            tool: tool.clone(),
            message,
        });
    }
    if text.trim().is_empty() {
        return Err(ToolError::EmptyResponse { tool: tool.clone() });
    }
    let payload: Value = serde_json::from_str(&text).map_err(|e| ToolError::InvalidPayload {
        tool: tool.clone(),
        message: e.to_string(),
    })?;
    // Some servers report failures as `{"error": "..."}` in a successful envelope.
    if let Some(error) = payload.get("error").and_then(Value::as_str) {
        if payload.as_object().is_some_and(|o| o.len() == 1) {
            return Err(ToolError::Reported {
                tool: tool.clone(),
                message: error.to_string(),
            });
        }
    }
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::FieldKind;
    use assert_matches::assert_matches;
    use serde_json::json;

    struct Canned(ToolEnvelope);

    #[async_trait]
    impl ToolChannel for Canned {
        async fn call_tool(&self, _: &ToolName, _: Value) -> Result<ToolEnvelope, ToolError> {
            Ok(self.0.clone())
        }
        async fn close(&self) -> Result<(), ToolError> {
            Ok(())
        }
    }

    fn bridge(envelope: ToolEnvelope) -> ToolBridge {
        ToolBridge::new(Arc::new(Canned(envelope)))
    }

    fn search() -> ToolName {
        ToolName::new("hybrid_search").unwrap()
    }

    fn schema() -> OutputSchema {
        OutputSchema::object("hybrid_search").require("results", FieldKind::Array)
    }

    #[derive(Debug, Deserialize)]
    struct Results {
        results: Vec<Value>,
    }

    #[tokio::test]
    async fn unwraps_text_blocks_and_deserialises() {
        let envelope = ToolEnvelope {
            content: vec![
                ContentBlock::text(r#"{"results": [{"id"#),
                ContentBlock {
                    kind: "image".into(),
                    text: None,
                },
                ContentBlock::text(r#"": "ip_1"}]}"#),
            ],
            is_error: false,
        };
        let out: Results = bridge(envelope).call(&search(), json!({}), &schema()).await.unwrap();
        assert_eq!(out.results.len(), 1);
    }

    #[tokio::test]
    async fn errors_name_the_tool() {
        let err = bridge(ToolEnvelope::json(&json!({"items": []})))
            .call_value(&search(), json!({}), &schema())
            .await
            .unwrap_err();
        assert_matches!(&err, ToolError::SchemaMismatch { tool, .. } if tool.as_str() == "hybrid_search");
        assert!(err.to_string().contains("hybrid_search"));

        let err = bridge(ToolEnvelope::error("index offline"))
            .call_value(&search(), json!({}), &schema())
            .await
            .unwrap_err();
        assert_matches!(err, ToolError::Reported { ref message, .. } if message == "index offline");

        let err = bridge(ToolEnvelope::default())
            .call_value(&search(), json!({}), &schema())
            .await
            .unwrap_err();
        assert_matches!(err, ToolError::EmptyResponse { .. });

        let err = bridge(ToolEnvelope::json(&json!({"error": "quota"})))
            .call_value(&search(), json!({}), &schema())
            .await
            .unwrap_err();
        assert_matches!(err, ToolError::Reported { .. });
    }

    #[test]
    fn envelope_deserialises_from_wire_form() {
        let envelope: ToolEnvelope =
            serde_json::from_value(json!({"content": [{"type": "text", "text": "{}"}], "isError": true})).unwrap();
        assert!(envelope.is_error);
    }

    #[test]
    fn only_path_like_values_are_resolved() {
        let root = Path::new("/srv/stagewright");
        let config = ToolServerConfig {
            command: "uvx".into(),
            cwd: Some(PathBuf::from("servers/kb")),
            ..ToolServerConfig::default()
        };
        assert_eq!(
            config.resolve(root).unwrap(),
            ConnectionParams::Stdio {
                command: "uvx".into(),
                args: vec![],
                cwd: Some(PathBuf::from("/srv/stagewright/servers/kb")),
                env: BTreeMap::new(),
            }
        );

        let config = ToolServerConfig {
            command: "./bin/kb-server".into(),
            ..ToolServerConfig::default()
        };
        assert_matches!(
            config.resolve(root).unwrap(),
            ConnectionParams::Stdio { command, cwd: None, .. } if command == "/srv/stagewright/./bin/kb-server"
        );

        let config = ToolServerConfig {
            command: "/usr/bin/kb".into(),
            cwd: Some(PathBuf::from("/tmp")),
            ..ToolServerConfig::default()
        };
        assert_matches!(
            config.resolve(root).unwrap(),
            ConnectionParams::Stdio { command, cwd: Some(cwd), .. } if command == "/usr/bin/kb" && cwd == Path::new("/tmp")
        );
    }

    #[test]
    fn url_selects_http_and_empty_config_fails() {
        let config = ToolServerConfig {
            url: Some("http://localhost:8931/mcp".into()),
            ..ToolServerConfig::default()
        };
        assert_matches!(config.resolve(Path::new("/")), Ok(ConnectionParams::Http { .. }));
        assert_matches!(
            ToolServerConfig::default().resolve(Path::new("/")),
            Err(ToolError::Connection { .. })
        );
    }
}
