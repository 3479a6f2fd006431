//! Port for the language model.
//!
//! A model call takes a prompt and returns text. The request has no tool
//! list: model-driven stages never receive a live tool-invocation interface,
//! all tool traffic goes through [`crate::tools::ToolBridge`] in tool-driven
//! stages.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::{RetryPolicy, TokenCount, Usage};

/// One model call.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    /// Name of the calling stage, for logs and metrics.
    pub stage: String,
    pub system: String,
    pub prompt: String,
    /// Hard ceiling on generated tokens.
    pub max_output_tokens: TokenCount,
}

/// Why generation stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    EndTurn,
    MaxTokens,
    StopSequence,
    Other,
}

/// A model response.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub text: String,
    pub usage: Usage,
    pub stop_reason: StopReason,
}

/// Failures of an [`LlmProvider`].
#[derive(Debug, Clone, Error, PartialEq)]
pub enum LlmError {
    /// The request never got a response.
    #[error("model request failed: {message}")]
    Transport { message: String },

    /// HTTP 429.
    #[error("model rate limit reached")]
    RateLimited { retry_after: Option<Duration> },

    /// The provider is temporarily overloaded (HTTP 529/503).
    #[error("model provider overloaded")]
    Overloaded { retry_after: Option<Duration> },

    /// HTTP 401/403.
    #[error("model provider rejected the credentials")]
    Authentication,

    /// Any other non-success response.
    #[error("model provider returned {status}: {message}")]
    Api { status: u16, message: String },

    /// A success response that could not be decoded.
    #[error("model response could not be decoded: {message}")]
    InvalidResponse { message: String },
}

impl LlmError {
    pub fn retry_policy(&self) -> RetryPolicy {
        match self {
            Self::Transport { .. } => RetryPolicy::Retryable { after: None },
            Self::RateLimited { retry_after } | Self::Overloaded { retry_after } => RetryPolicy::Retryable {
                after: *retry_after,
            },
            Self::Api { status, .. } if *status >= 500 => RetryPolicy::Retryable { after: None },
            _ => RetryPolicy::NonRetryable,
        }
    }
}

/// A text-completion model.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion, LlmError>;
}
