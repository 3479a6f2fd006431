//! Top-level error and retry-policy types for the Stagewright pipeline domain.
//!
//! [`PipelineError`] covers conditions that halt the pipeline itself.
//! Component-level errors (e.g. [`crate::tools::ToolError`],
//! [`crate::llm::LlmError`]) are defined in their respective modules.
//!
//! [`RetryPolicy`] is a cross-cutting concern: any error type that participates
//! in retry decisions must be able to produce a [`RetryPolicy`].

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{CostBudget, StageId, TokenCost};

// ---------------------------------------------------------------------------
// Retry semantics
// ---------------------------------------------------------------------------

/// Whether an error condition is safe to retry and, if so, after what delay.
///
/// Returned by infrastructure error types to let adapters decide whether to
/// re-invoke an operation without surfacing a failure.
///
/// - `Retryable` errors: API timeouts, transient rate-limit or overload responses.
/// - `NonRetryable` errors: budget exceeded, invalid configuration, authentication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RetryPolicy {
    /// The operation may be retried.
    ///
    /// `after` optionally specifies the minimum delay before retrying (e.g.
    /// derived from a `retry-after` response header).
    Retryable {
        /// Minimum back-off before the next attempt. `None` means apply the
        /// caller's own back-off schedule.
        after: Option<Duration>,
    },
    /// The operation must not be retried.
    NonRetryable,
}

impl RetryPolicy {
    /// Returns `true` for [`RetryPolicy::Retryable`].
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable { .. })
    }
}

// ---------------------------------------------------------------------------
// Pipeline-level errors
// ---------------------------------------------------------------------------

/// Errors that halt the pipeline itself.
///
/// These are distinct from per-component errors (tool failure, LLM provider
/// failure) in that they represent conditions the pipeline cannot recover from
/// within its normal repair budget.
#[derive(Debug, Error, Serialize, Deserialize)]
pub enum PipelineError {
    /// Accumulated token cost reached the configured budget before completion.
    ///
    /// Checked cooperatively at stage boundaries; never retried automatically.
    #[error("Cost budget exceeded: accumulated {accumulated}, limit {limit}")]
    BudgetExceeded {
        /// Total cost accumulated at the point of the check.
        accumulated: TokenCost,
        /// Configured budget that was reached.
        limit: CostBudget,
    },

    /// The pipeline definition is invalid.
    ///
    /// Produced at load time; the pipeline never starts with an invalid definition.
    #[error("Configuration error: {message}")]
    ConfigurationError {
        /// Description of the configuration problem.
        message: String,
    },

    /// A state transition was requested that the current state does not permit
    /// (e.g. resuming a run that is not paused).
    #[error("Invalid state transition: {message}")]
    InvalidTransition {
        /// Description of the rejected transition.
        message: String,
    },

    /// A stage referenced by the persisted state is absent from the definition
    /// supplied on resume.
    #[error("Stage {stage} is not part of the pipeline definition")]
    UnknownStage {
        /// The missing stage ordinal.
        stage: StageId,
    },
}

impl PipelineError {
    /// Shorthand for [`PipelineError::ConfigurationError`].
    pub fn config(message: impl Into<String>) -> Self {
        Self::ConfigurationError {
            message: message.into(),
        }
    }

    /// Shorthand for [`PipelineError::InvalidTransition`].
    pub fn transition(message: impl Into<String>) -> Self {
        Self::InvalidTransition {
            message: message.into(),
        }
    }
}
