use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use pipeline::follow_up::FinalAnswer;
use pipeline::persistence::{StateStore, StoreError};
use pipeline::state::PipelineState;
use pipeline::{AgentSlug, SessionId};

#[derive(Debug, Default)]
struct Inner {
    states: HashMap<SessionId, String>,
    answers: HashMap<SessionId, String>,
    active: HashMap<AgentSlug, SessionId>,
    saves: usize,
}

/// In-memory [`StateStore`].
///
/// Snapshots are kept in their serialised form so a load exercises the same
/// decoding path as the file store. Cloning shares the underlying maps.
#[derive(Debug, Clone, Default)]
pub struct MemoryStateStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Number of `save` calls so far.
    pub fn save_count(&self) -> usize {
        self.lock().saves
    }

    /// Stores a raw answer document, bypassing validation.
    pub fn put_raw_answer(&self, session: SessionId, raw: impl Into<String>) {
        self.lock().answers.insert(session, raw.into());
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self, session: SessionId) -> Result<Option<PipelineState>, StoreError> {
        let Some(json) = self.lock().states.get(&session).cloned() else {
            return Ok(None);
        };
        PipelineState::from_json(&json)
            .map(Some)
            .map_err(|source| StoreError::Corrupt { session, source })
    }

    async fn save(&self, state: &PipelineState) -> Result<(), StoreError> {
        let json = state.to_json().map_err(|e| StoreError::Serialization {
            message: e.to_string(),
        })?;
        let mut inner = self.lock();
        inner.states.insert(state.session_id(), json);
        inner.saves += 1;
        Ok(())
    }

    async fn save_answer(&self, answer: &FinalAnswer) -> Result<(), StoreError> {
        let json = serde_json::to_string(answer).map_err(|e| StoreError::Serialization {
            message: e.to_string(),
        })?;
        self.lock().answers.insert(answer.session_id, json);
        Ok(())
    }

    async fn load_answer(&self, session: SessionId) -> Result<Option<String>, StoreError> {
        Ok(self.lock().answers.get(&session).cloned())
    }

    async fn active_session(&self, agent: &AgentSlug) -> Result<Option<SessionId>, StoreError> {
        Ok(self.lock().active.get(agent).copied())
    }

    async fn set_active(&self, agent: &AgentSlug, session: SessionId) -> Result<(), StoreError> {
        self.lock().active.insert(agent.clone(), session);
        Ok(())
    }

    async fn release_active(&self, agent: &AgentSlug) -> Result<(), StoreError> {
        self.lock().active.remove(agent);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeline::stage::PipelineDefinition;

    #[tokio::test]
    async fn clones_share_storage() {
        let store = MemoryStateStore::new();
        let other = store.clone();
        let state = PipelineState::new(SessionId::new_random(), "q", &PipelineDefinition::research());
        store.save(&state).await.unwrap();
        assert_eq!(other.load(state.session_id()).await.unwrap(), Some(state));
        assert_eq!(other.save_count(), 1);
    }
}
