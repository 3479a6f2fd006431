//! Anthropic Messages API provider.

use std::time::Duration;

use async_trait::async_trait;
use pipeline::llm::{Completion, CompletionRequest, LlmError, LlmProvider, StopReason};
use pipeline::Usage;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use crate::retry::Backoff;

pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
pub const API_VERSION: &str = "2023-06-01";

/// Connection settings for [`AnthropicProvider`].
#[derive(Debug, Clone)]
pub struct AnthropicConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
    pub timeout: Duration,
    pub backoff: Backoff,
}

impl AnthropicConfig {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: model.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: Duration::from_secs(300),
            backoff: Backoff::default(),
        }
    }
}

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u64,
    #[serde(skip_serializing_if = "str::is_empty")]
    system: &'a str,
    messages: [Message<'a>; 1],
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: ResponseUsage,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ResponseUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    message: String,
}

/// [`LlmProvider`] over the Messages API.
#[derive(Debug, Clone)]
pub struct AnthropicProvider {
    client: Client,
    config: AnthropicConfig,
}

impl AnthropicProvider {
    pub fn new(config: AnthropicConfig) -> Result<Self, LlmError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| LlmError::Transport { message: e.to_string() })?;
        Ok(Self { client, config })
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    async fn send(&self, request: &CompletionRequest) -> Result<Completion, LlmError> {
        let body = MessagesRequest {
            model: &self.config.model,
            max_tokens: request.max_output_tokens.as_u64().max(1),
            system: &request.system,
            messages: [Message {
                role: "user",
                content: &request.prompt,
            }],
        };
        let url = format!("{}/v1/messages", self.config.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(url)
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::Transport { message: e.to_string() })?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = retry_after(response.headers());
            let text = response.text().await.unwrap_or_default();
            return Err(classify(status, retry_after, &text));
        }

        let parsed: MessagesResponse = response
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse { message: e.to_string() })?;
        let text = parsed
            .content
            .iter()
            .filter(|b| b.kind == "text")
            .filter_map(|b| b.text.as_deref())
            .collect::<Vec<_>>()
            .join("");
        let stop_reason = match parsed.stop_reason.as_deref() {
            Some("end_turn") => StopReason::EndTurn,
            Some("max_tokens") => StopReason::MaxTokens,
            Some("stop_sequence") => StopReason::StopSequence,
            _ => StopReason::Other,
        };
        Ok(Completion {
            text,
            usage: Usage::new(parsed.usage.input_tokens, parsed.usage.output_tokens),
            stop_reason,
        })
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    #[tracing::instrument(skip_all, fields(stage = %request.stage, model = %self.config.model))]
    async fn complete(&self, request: CompletionRequest) -> Result<Completion, LlmError> {
        let completion = self.config.backoff.run(|| self.send(&request)).await?;
        tracing::debug!(
            input_tokens = %completion.usage.input_tokens,
            output_tokens = %completion.usage.output_tokens,
            stop_reason = ?completion.stop_reason,
            "model call completed"
        );
        Ok(completion)
    }
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|s| s.is_finite() && *s >= 0.0)
        .map(Duration::from_secs_f64)
}

fn classify(status: StatusCode, retry_after: Option<Duration>, body: &str) -> LlmError {
    let message = serde_json::from_str::<ErrorResponse>(body)
        .map(|e| e.error.message)
        .unwrap_or_else(|_| body.chars().take(500).collect());
    match status.as_u16() {
        429 => LlmError::RateLimited { retry_after },
        503 | 529 => LlmError::Overloaded { retry_after },
        401 | 403 => LlmError::Authentication,
        code => LlmError::Api { status: code, message },
    }
}

#[cfg(test)]
mod tests {
    use pipeline::TokenCount;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn provider(server: &MockServer, retries: u32) -> AnthropicProvider {
        let mut config = AnthropicConfig::new("test-key", "claude-sonnet-4-20250514");
        config.base_url = server.uri();
        config.backoff = Backoff::immediate(retries);
        AnthropicProvider::new(config).unwrap()
    }

    fn request() -> CompletionRequest {
        CompletionRequest {
            stage: "analyze".to_string(),
            system: "Answer with JSON.".to_string(),
            prompt: "<question>pumps?</question>".to_string(),
            max_output_tokens: TokenCount::new(1_024),
        }
    }

    fn success() -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(json!({
            "id": "msg_1",
            "type": "message",
            "role": "assistant",
            "content": [{"type": "text", "text": "{\"sub_queries\": []}"}],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 120, "output_tokens": 30}
        }))
    }

    #[tokio::test]
    async fn completion_is_decoded() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("x-api-key", "test-key"))
            .and(header("anthropic-version", API_VERSION))
            .respond_with(success())
            .expect(1)
            .mount(&server)
            .await;

        let completion = provider(&server, 0).complete(request()).await.unwrap();

        assert_eq!(completion.text, "{\"sub_queries\": []}");
        assert_eq!(completion.usage, Usage::new(120, 30));
        assert_eq!(completion.stop_reason, StopReason::EndTurn);
    }

    #[tokio::test]
    async fn rate_limit_is_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "0"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST")).respond_with(success()).mount(&server).await;

        let completion = provider(&server, 2).complete(request()).await.unwrap();

        assert_eq!(completion.usage.output_tokens, TokenCount::new(30));
        assert_eq!(server.received_requests().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn authentication_failure_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({
                "type": "error",
                "error": {"type": "authentication_error", "message": "invalid x-api-key"}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let error = provider(&server, 3).complete(request()).await.unwrap_err();

        assert_eq!(error, LlmError::Authentication);
    }

    #[tokio::test]
    async fn server_errors_exhaust_the_retry_bound() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_json(json!({
                "type": "error",
                "error": {"type": "api_error", "message": "internal"}
            })))
            .expect(3)
            .mount(&server)
            .await;

        let error = provider(&server, 2).complete(request()).await.unwrap_err();

        assert_eq!(
            error,
            LlmError::Api {
                status: 500,
                message: "internal".to_string()
            }
        );
    }

    #[test]
    fn overload_carries_retry_after() {
        let error = classify(StatusCode::from_u16(529).unwrap(), Some(Duration::from_secs(2)), "");
        assert_eq!(
            error,
            LlmError::Overloaded {
                retry_after: Some(Duration::from_secs(2))
            }
        );
    }
}
