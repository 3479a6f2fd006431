//! Tool channel over HTTP: one JSON-RPC request per POST.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use pipeline::tools::{ToolChannel, ToolEnvelope, ToolError};
use pipeline::ToolName;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT};
use reqwest::Client;
use serde_json::Value;

use crate::rpc::{self, Request, RequestIds, Response};

const SESSION_HEADER: &str = "mcp-session-id";

/// A tool server reached over HTTP.
#[derive(Debug)]
pub struct HttpChannel {
    client: Client,
    url: String,
    ids: RequestIds,
    session: Mutex<Option<HeaderValue>>,
    closed: AtomicBool,
}

impl HttpChannel {
    /// Connects to `url` and performs the `initialize` handshake.
    pub async fn connect(url: &str, timeout: Duration) -> Result<Self, ToolError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ToolError::Connection { message: e.to_string() })?;
        let channel = Self {
            client,
            url: url.to_string(),
            ids: RequestIds::new(),
            session: Mutex::new(None),
            closed: AtomicBool::new(false),
        };

        let (response, headers) = channel
            .post(&Request::call(channel.ids.next(), "initialize", rpc::initialize_params()))
            .await
            .map_err(|message| ToolError::Connection {
                message: format!("{url}: {message}"),
            })?;
        if let Some(error) = response.and_then(|r| r.error) {
            return Err(ToolError::Connection {
                message: format!("{url} rejected initialize: {}", error.message),
            });
        }
        if let Some(session) = headers.get(SESSION_HEADER) {
            if let Ok(mut slot) = channel.session.lock() {
                *slot = Some(session.clone());
            }
        }
        channel
            .post(&Request::notification("notifications/initialized"))
            .await
            .map_err(|message| ToolError::Connection { message })?;
        tracing::debug!(url = %url, "tool server initialized");
        Ok(channel)
    }

    /// Sends one request. Notifications yield `None`.
    async fn post(&self, request: &Request<'_>) -> Result<(Option<Response>, HeaderMap), String> {
        let mut builder = self
            .client
            .post(&self.url)
            .header(ACCEPT, "application/json")
            .json(request);
        let session = self.session.lock().ok().and_then(|s| s.clone());
        if let Some(session) = session {
            builder = builder.header(SESSION_HEADER, session);
        }
        let response = builder.send().await.map_err(|e| e.to_string())?;
        let status = response.status();
        let headers = response.headers().clone();
        if !status.is_success() {
            return Err(format!("server returned {status}"));
        }
        let body = response.text().await.map_err(|e| e.to_string())?;
        if body.trim().is_empty() {
            return Ok((None, headers));
        }
        serde_json::from_str(&body)
            .map(|r| (Some(r), headers))
            .map_err(|e| format!("response is not JSON-RPC: {e}"))
    }
}

#[async_trait]
impl ToolChannel for HttpChannel {
    async fn call_tool(&self, tool: &ToolName, args: Value) -> Result<ToolEnvelope, ToolError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ToolError::Closed);
        }
        let request = Request::call(self.ids.next(), "tools/call", rpc::call_params(tool, args));
        match self.post(&request).await {
            Ok((Some(response), _)) => rpc::into_envelope(tool, response),
            Ok((None, _)) => Err(ToolError::EmptyResponse { tool: tool.clone() }),
            Err(message) => Err(ToolError::Transport {
                tool: tool.clone(),
                message,
            }),
        }
    }

    async fn close(&self) -> Result<(), ToolError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    async fn server() -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "initialize"})))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header(SESSION_HEADER, "abc")
                    .set_body_json(json!({"jsonrpc": "2.0", "id": 1, "result": {"capabilities": {}}})),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "notifications/initialized"})))
            .respond_with(ResponseTemplate::new(202))
            .mount(&server)
            .await;
        server
    }

    #[tokio::test]
    async fn tool_call_carries_the_session_and_returns_the_envelope() {
        let server = server().await;
        Mock::given(method("POST"))
            .and(header(SESSION_HEADER, "abc"))
            .and(body_partial_json(json!({
                "method": "tools/call",
                "params": {"name": "web_search", "arguments": {"queries": ["pumps"]}}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0", "id": 2,
                "result": {"content": [{"type": "text", "text": "{\"results\": []}"}]}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let channel = HttpChannel::connect(&server.uri(), Duration::from_secs(5)).await.unwrap();
        let tool = ToolName::new("web_search").unwrap();
        let envelope = channel.call_tool(&tool, json!({"queries": ["pumps"]})).await.unwrap();

        assert!(!envelope.is_error);
        let text = assert_matches!(envelope.content.as_slice(), [block] => block.text.clone().unwrap());
        // Servers format their payloads freely; only the parsed value matters.
        assert_eq!(serde_json::from_str::<Value>(&text).unwrap(), json!({"results": []}));
        channel.close().await.unwrap();
        assert_matches!(channel.call_tool(&tool, json!({})).await, Err(ToolError::Closed));
    }

    #[tokio::test]
    async fn server_error_is_a_transport_failure_naming_the_tool() {
        let server = server().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "tools/call"})))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let channel = HttpChannel::connect(&server.uri(), Duration::from_secs(5)).await.unwrap();
        let tool = ToolName::new("hybrid_search").unwrap();

        assert_matches!(
            channel.call_tool(&tool, json!({})).await,
            Err(ToolError::Transport { tool, .. }) if tool.as_str() == "hybrid_search"
        );
    }

    #[tokio::test]
    async fn unreachable_server_is_a_connection_failure() {
        let result = HttpChannel::connect("http://127.0.0.1:9/mcp", Duration::from_millis(500)).await;
        assert_matches!(result, Err(ToolError::Connection { .. }));
    }
}
