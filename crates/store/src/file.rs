use std::path::{Path, PathBuf};

use async_trait::async_trait;
use pipeline::follow_up::FinalAnswer;
use pipeline::persistence::{StateStore, StoreError};
use pipeline::state::PipelineState;
use pipeline::{AgentSlug, SessionId};
use tokio::io::AsyncWriteExt;

const STATE_FILE: &str = "state.json";
const ANSWER_FILE: &str = "answer.json";

/// File-system [`StateStore`].
#[derive(Debug, Clone)]
pub struct FileStateStore {
    root: PathBuf,
}

impl FileStateStore {
    /// A store rooted at `root`. Directories are created lazily.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn session_dir(&self, session: SessionId) -> PathBuf {
        self.root.join("sessions").join(session.to_string())
    }

    fn marker(&self, agent: &AgentSlug) -> PathBuf {
        self.root.join("active").join(agent.as_str())
    }
}

fn io(context: impl Into<String>) -> impl FnOnce(std::io::Error) -> StoreError {
    let context = context.into();
    move |source| StoreError::Io { context, source }
}

/// Reads `path`, mapping "not found" to `None`.
async fn read_optional(path: &Path) -> Result<Option<String>, StoreError> {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => Ok(Some(text)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(io(format!("reading {}", path.display()))(e)),
    }
}

/// Writes `bytes` to `path` via a sibling temp file and rename.
async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    tokio::fs::create_dir_all(parent)
        .await
        .map_err(io(format!("creating {}", parent.display())))?;

    let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or("document");
    let temp = parent.join(format!(".{file_name}.{}.tmp", uuid::Uuid::new_v4().simple()));
    let mut file = tokio::fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp)
        .await
        .map_err(io(format!("creating {}", temp.display())))?;
    let written = async {
        file.write_all(bytes).await?;
        file.sync_all().await
    }
    .await;
    drop(file);
    if let Err(e) = written {
        let _ = tokio::fs::remove_file(&temp).await;
        return Err(io(format!("writing {}", temp.display()))(e));
    }
    if let Err(e) = tokio::fs::rename(&temp, path).await {
        let _ = tokio::fs::remove_file(&temp).await;
        return Err(io(format!("replacing {}", path.display()))(e));
    }
    Ok(())
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn load(&self, session: SessionId) -> Result<Option<PipelineState>, StoreError> {
        let path = self.session_dir(session).join(STATE_FILE);
        let Some(text) = read_optional(&path).await? else {
            return Ok(None);
        };
        PipelineState::from_json(&text)
            .map(Some)
            .map_err(|source| StoreError::Corrupt { session, source })
    }

    async fn save(&self, state: &PipelineState) -> Result<(), StoreError> {
        let json = state.to_json().map_err(|e| StoreError::Serialization {
            message: e.to_string(),
        })?;
        let path = self.session_dir(state.session_id()).join(STATE_FILE);
        write_atomic(&path, json.as_bytes()).await?;
        tracing::debug!(session = %state.session_id(), events = state.events().len(), "state checkpointed");
        Ok(())
    }

    async fn save_answer(&self, answer: &FinalAnswer) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(answer).map_err(|e| StoreError::Serialization {
            message: e.to_string(),
        })?;
        let path = self.session_dir(answer.session_id).join(ANSWER_FILE);
        write_atomic(&path, json.as_bytes()).await
    }

    async fn load_answer(&self, session: SessionId) -> Result<Option<String>, StoreError> {
        read_optional(&self.session_dir(session).join(ANSWER_FILE)).await
    }

    async fn active_session(&self, agent: &AgentSlug) -> Result<Option<SessionId>, StoreError> {
        let path = self.marker(agent);
        let Some(text) = read_optional(&path).await? else {
            return Ok(None);
        };
        let session = SessionId::parse(&text);
        if session.is_none() {
            tracing::warn!(agent = %agent, marker = %path.display(), "ignoring unreadable active-run marker");
        }
        Ok(session)
    }

    async fn set_active(&self, agent: &AgentSlug, session: SessionId) -> Result<(), StoreError> {
        write_atomic(&self.marker(agent), session.to_string().as_bytes()).await
    }

    async fn release_active(&self, agent: &AgentSlug) -> Result<(), StoreError> {
        let path = self.marker(agent);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io(format!("removing {}", path.display()))(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use pipeline::shapes::DocumentView;
    use pipeline::stage::{PipelineDefinition, StageResult};
    use pipeline::{StageId, TokenCost, Usage};
    use serde_json::json;

    fn agent() -> AgentSlug {
        AgentSlug::new("deep-research").unwrap()
    }

    fn state() -> PipelineState {
        let def = PipelineDefinition::research();
        PipelineState::new(SessionId::new_random(), "What does ISA 600 cover?", &def)
            .with_agent(agent())
            .stage_started(StageId::new(0), 0)
            .stage_completed(
                StageId::new(0),
                0,
                StageResult::executed("t", json!({"queries": ["a"]}), Usage::new(10, 5), "s"),
                TokenCost::new(0.25).unwrap(),
            )
            .pause_requested(StageId::new(0))
    }

    #[tokio::test]
    async fn state_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path());
        let state = state();
        store.save(&state).await.unwrap();
        let loaded = store.load(state.session_id()).await.unwrap().expect("saved");
        assert_eq!(loaded, state);
        assert!(loaded.is_paused());
    }

    #[tokio::test]
    async fn save_replaces_without_leaving_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path());
        let first = state();
        store.save(&first).await.unwrap();
        let second = first.resumed("proceed").unwrap();
        store.save(&second).await.unwrap();

        let session_dir = dir.path().join("sessions").join(first.session_id().to_string());
        let names: Vec<String> = std::fs::read_dir(&session_dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec![STATE_FILE.to_string()]);
        assert!(!store.load(first.session_id()).await.unwrap().unwrap().is_paused());
    }

    #[tokio::test]
    async fn missing_and_corrupt_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path());
        let session = SessionId::new_random();
        assert!(store.load(session).await.unwrap().is_none());

        let path = dir.path().join("sessions").join(session.to_string());
        std::fs::create_dir_all(&path).unwrap();
        std::fs::write(path.join(STATE_FILE), "{\"format\":\"other\"}").unwrap();
        assert_matches!(store.load(session).await, Err(StoreError::Corrupt { .. }));
    }

    #[tokio::test]
    async fn active_marker_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path());
        let session = SessionId::new_random();
        assert_eq!(store.active_session(&agent()).await.unwrap(), None);
        store.set_active(&agent(), session).await.unwrap();
        assert_eq!(store.active_session(&agent()).await.unwrap(), Some(session));
        store.release_active(&agent()).await.unwrap();
        store.release_active(&agent()).await.unwrap();
        assert_eq!(store.active_session(&agent()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn answers_are_stored_raw() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path());
        let session = SessionId::new_random();
        let answer = FinalAnswer::from_document(session, "q", 0, &DocumentView::default());
        store.save_answer(&answer).await.unwrap();
        let raw = store.load_answer(session).await.unwrap().expect("answer");
        let parsed: FinalAnswer = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed, answer);
        assert!(store.load_answer(SessionId::new_random()).await.unwrap().is_none());
    }
}
