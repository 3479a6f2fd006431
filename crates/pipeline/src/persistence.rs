//! Port for durable run state.
//!
//! One document per run, addressed by session id, plus the compact answer
//! document written on completion and a per-agent active-run marker. The
//! marker is the only pipeline-identifying durable state: completed and
//! failed runs release it, paused runs keep it so `resume` can find them.

use async_trait::async_trait;
use thiserror::Error;

use crate::follow_up::FinalAnswer;
use crate::state::{PipelineState, SnapshotError};
use crate::{AgentSlug, RetryPolicy, SessionId};

/// Failures of a [`StateStore`] implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying storage failed.
    #[error("storage I/O failed ({context}): {source}")]
    Io {
        /// What was being done, e.g. the path written.
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// A stored snapshot could not be decoded.
    #[error("state for session {session} is corrupt: {source}")]
    Corrupt {
        session: SessionId,
        #[source]
        source: SnapshotError,
    },

    /// A document could not be encoded.
    #[error("serialisation failed: {message}")]
    Serialization { message: String },
}

impl StoreError {
    /// Transient I/O may be retried; corruption may not.
    pub fn retry_policy(&self) -> RetryPolicy {
        match self {
            Self::Io { source, .. }
                if matches!(
                    source.kind(),
                    std::io::ErrorKind::Interrupted | std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                RetryPolicy::Retryable { after: None }
            }
            _ => RetryPolicy::NonRetryable,
        }
    }
}

/// Durable storage for pipeline state.
///
/// `save` must be atomic with respect to `load`: a reader never observes a
/// partially written snapshot.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Loads the state of `session`, `None` if it was never saved.
    async fn load(&self, session: SessionId) -> Result<Option<PipelineState>, StoreError>;

    /// Checkpoints `state`, replacing any earlier snapshot of the same session.
    async fn save(&self, state: &PipelineState) -> Result<(), StoreError>;

    /// Writes the compact answer of a completed run.
    async fn save_answer(&self, answer: &FinalAnswer) -> Result<(), StoreError>;

    /// Reads the raw answer document of `session`.
    ///
    /// Returned unparsed; the follow-up loader decides how to treat malformed
    /// content.
    async fn load_answer(&self, session: SessionId) -> Result<Option<String>, StoreError>;

    /// The session currently marked active for `agent`.
    async fn active_session(&self, agent: &AgentSlug) -> Result<Option<SessionId>, StoreError>;

    /// Marks `session` as the active run of `agent`.
    async fn set_active(&self, agent: &AgentSlug, session: SessionId) -> Result<(), StoreError>;

    /// Clears the active-run marker of `agent`. Clearing an absent marker succeeds.
    async fn release_active(&self, agent: &AgentSlug) -> Result<(), StoreError>;
}
