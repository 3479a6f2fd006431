//! Stagewright language-model provider adapter.
//!
//! Implements the [`pipeline::llm::LlmProvider`] trait for Anthropic's
//! Messages API. Additional providers are added as new `impl` blocks in this
//! crate without any changes to the `pipeline` crate.
//!
//! ## Architectural Layer
//!
//! **Infrastructure.** HTTP transport, request formatting, response parsing,
//! `retry-after` handling, and exponential back-off live here. The
//! [`pipeline`] crate sees only [`pipeline::llm::LlmProvider`].
//!
//! Retries are bounded by [`Backoff`] and driven by
//! [`pipeline::RetryPolicy`]: rate limits, overloads, transport failures,
//! and 5xx responses are retried; everything else surfaces at once.

mod anthropic;
mod pricing;
mod retry;

pub use anthropic::{AnthropicConfig, AnthropicProvider, API_VERSION, DEFAULT_BASE_URL};
pub use pricing::pricing_for;
pub use retry::Backoff;
