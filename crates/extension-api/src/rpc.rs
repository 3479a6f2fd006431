//! JSON-RPC 2.0 framing shared by both transports.

use std::sync::atomic::{AtomicU64, Ordering};

use pipeline::tools::{ToolEnvelope, ToolError};
use pipeline::ToolName;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub(crate) const PROTOCOL_VERSION: &str = "2024-11-05";

#[derive(Debug, Serialize)]
pub(crate) struct Request<'a> {
    jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<u64>,
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
}

impl<'a> Request<'a> {
    pub(crate) fn call(id: u64, method: &'a str, params: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id: Some(id),
            method,
            params: Some(params),
        }
    }

    pub(crate) fn notification(method: &'a str) -> Self {
        Self {
            jsonrpc: "2.0",
            id: None,
            method,
            params: None,
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct Response {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RpcError {
    pub code: i64,
    #[serde(default)]
    pub message: String,
}

/// Monotonic request ids, one sequence per channel.
#[derive(Debug)]
pub(crate) struct RequestIds(AtomicU64);

impl RequestIds {
    pub(crate) fn new() -> Self {
        Self(AtomicU64::new(1))
    }

    pub(crate) fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

pub(crate) fn initialize_params() -> Value {
    json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {"name": "stagewright", "version": env!("CARGO_PKG_VERSION")},
    })
}

pub(crate) fn call_params(tool: &ToolName, args: Value) -> Value {
    json!({ "name": tool.as_str(), "arguments": args })
}

/// Turns a `tools/call` response into the raw envelope.
pub(crate) fn into_envelope(tool: &ToolName, response: Response) -> Result<ToolEnvelope, ToolError> {
    if let Some(error) = response.error {
        return Err(ToolError::Reported {
            tool: tool.clone(),
            message: format!("{} (code {})", error.message, error.code),
        });
    }
    let Some(result) = response.result else {
        return Err(ToolError::EmptyResponse { tool: tool.clone() });
    };
    serde_json::from_value(result).map_err(|e| ToolError::InvalidPayload {
        tool: tool.clone(),
        message: format!("not a tool result envelope: {e}"),
    })
}
