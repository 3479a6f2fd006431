//! Continuation context carried from a completed run into a related new run.
//!
//! A completed run persists a compact [`FinalAnswer`] next to its state. A
//! follow-up run points back at it through `previous_session_id`; the
//! [`FollowUpContextLoader`] turns that document into a [`FollowUpContext`].
//! A missing or malformed document is never an error: the run simply proceeds
//! without follow-up context.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::evidence::Citation;
use crate::persistence::StateStore;
use crate::shapes::{split_sections, DocumentView};
use crate::tokens::truncate_to_tokens;
use crate::{EvidenceId, SectionId, SessionId, Timestamp, TokenCount};

/// Format tag of a persisted answer document.
pub const ANSWER_FORMAT: &str = "stagewright.answer";

/// Excerpt length kept per prior section.
const EXCERPT_TOKENS: TokenCount = TokenCount::new(100);

/// Compact machine-readable answer written when a run completes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalAnswer {
    pub format: String,
    pub session_id: SessionId,
    pub question: String,
    /// Ordinal in a follow-up chain; `0` for an original run.
    #[serde(default)]
    pub follow_up_number: u32,
    pub answer: String,
    #[serde(default)]
    pub citations: Vec<Citation>,
    #[serde(default)]
    pub sub_queries: Vec<String>,
    /// Sources cited by this answer.
    #[serde(default)]
    pub evidence_ids: Vec<EvidenceId>,
    /// Every evidence id presented anywhere in the chain up to and including
    /// this run, cited or not.
    #[serde(default)]
    pub seen_evidence_ids: Vec<EvidenceId>,
    #[serde(default)]
    pub open_issues: Vec<String>,
    pub completed_at: Timestamp,
}

impl FinalAnswer {
    /// Builds the answer document from a rendered final document.
    pub fn from_document(
        session_id: SessionId,
        question: impl Into<String>,
        follow_up_number: u32,
        document: &DocumentView,
    ) -> Self {
        Self {
            format: ANSWER_FORMAT.to_string(),
            session_id,
            question: question.into(),
            follow_up_number,
            answer: document.answer.clone(),
            citations: document.citations.clone(),
            sub_queries: document.sub_queries.clone(),
            evidence_ids: document.evidence_ids.clone(),
            seen_evidence_ids: document.evidence_ids.clone(),
            open_issues: document.open_issues.clone(),
            completed_at: Timestamp::now(),
        }
    }

    /// Adds `ids` to the evidence recorded as seen. Kept sorted and unique.
    pub fn with_seen_evidence(mut self, ids: impl IntoIterator<Item = EvidenceId>) -> Self {
        let mut seen: BTreeSet<EvidenceId> = self.seen_evidence_ids.drain(..).collect();
        seen.extend(ids);
        self.seen_evidence_ids = seen.into_iter().collect();
        self
    }
}

/// One section of the prior answer, kept as a short excerpt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriorSection {
    pub id: SectionId,
    pub heading: String,
    pub excerpt: String,
}

/// Material from a prior run available to every stage of a follow-up run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FollowUpContext {
    pub previous_session_id: SessionId,
    /// Ordinal of the run this context feeds (1 for the first follow-up).
    pub follow_up_number: u32,
    pub previous_question: String,
    pub answer: String,
    pub sections: Vec<PriorSection>,
    pub sub_queries: Vec<String>,
    pub seen_evidence: BTreeSet<EvidenceId>,
}

impl FollowUpContext {
    /// Derives the context from a prior run's answer document.
    pub fn from_answer(answer: &FinalAnswer) -> Self {
        let sections = split_sections(&answer.answer)
            .into_iter()
            .enumerate()
            .filter_map(|(index, section)| {
                let id = SectionId::new(format!("s{}", index + 1))?;
                let excerpt = truncate_to_tokens(&section.body, EXCERPT_TOKENS);
                let excerpt = if excerpt.len() < section.body.len() {
                    format!("{}…", excerpt.trim_end())
                } else {
                    excerpt.to_string()
                };
                Some(PriorSection {
                    id,
                    heading: section.heading,
                    excerpt,
                })
            })
            .collect();

        let seen_evidence = answer
            .seen_evidence_ids
            .iter()
            .chain(&answer.evidence_ids)
            .chain(answer.citations.iter().map(|c| &c.evidence_id))
            .cloned()
            .collect();

        Self {
            previous_session_id: answer.session_id,
            follow_up_number: answer.follow_up_number + 1,
            previous_question: answer.question.clone(),
            answer: answer.answer.clone(),
            sections,
            sub_queries: answer.sub_queries.clone(),
            seen_evidence,
        }
    }

    /// `true` if any run of the chain already presented `id`.
    pub fn has_seen(&self, id: &EvidenceId) -> bool {
        self.seen_evidence.contains(id)
    }
}

/// Loads follow-up context for a prior session from the state store.
#[derive(Clone)]
pub struct FollowUpContextLoader {
    store: Arc<dyn StateStore>,
}

impl FollowUpContextLoader {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    /// Loads the answer document of `previous`.
    ///
    /// Returns `None` (and logs why) when the document is absent, unreadable,
    /// malformed, or belongs to a different session.
    #[tracing::instrument(skip(self), fields(previous = %previous))]
    pub async fn load(&self, previous: SessionId) -> Option<FollowUpContext> {
        let raw = match self.store.load_answer(previous).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                tracing::warn!("prior run has no answer document; continuing without follow-up context");
                return None;
            }
            Err(e) => {
                tracing::warn!(error = %e, "prior answer could not be read; continuing without follow-up context");
                return None;
            }
        };
        let answer: FinalAnswer = match serde_json::from_str(&raw) {
            Ok(answer) => answer,
            Err(e) => {
                tracing::warn!(error = %e, "prior answer is malformed; continuing without follow-up context");
                return None;
            }
        };
        if answer.format != ANSWER_FORMAT || answer.session_id != previous {
            tracing::warn!(
                format = %answer.format,
                session = %answer.session_id,
                "prior answer does not match the requested session; ignoring it"
            );
            return None;
        }
        let context = FollowUpContext::from_answer(&answer);
        tracing::debug!(
            sections = context.sections.len(),
            seen = context.seen_evidence.len(),
            follow_up_number = context.follow_up_number,
            "follow-up context loaded"
        );
        Some(context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{StateStore, StoreError};
    use crate::state::PipelineState;
    use crate::AgentSlug;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Answers(Mutex<HashMap<SessionId, String>>);

    #[async_trait]
    impl StateStore for Answers {
        async fn load(&self, _: SessionId) -> Result<Option<PipelineState>, StoreError> {
            Ok(None)
        }
        async fn save(&self, _: &PipelineState) -> Result<(), StoreError> {
            Ok(())
        }
        async fn save_answer(&self, answer: &FinalAnswer) -> Result<(), StoreError> {
            let raw = serde_json::to_string(answer).map_err(|e| StoreError::Serialization {
                message: e.to_string(),
            })?;
            self.0.lock().unwrap().insert(answer.session_id, raw);
            Ok(())
        }
        async fn load_answer(&self, session: SessionId) -> Result<Option<String>, StoreError> {
            Ok(self.0.lock().unwrap().get(&session).cloned())
        }
        async fn active_session(&self, _: &AgentSlug) -> Result<Option<SessionId>, StoreError> {
            Ok(None)
        }
        async fn set_active(&self, _: &AgentSlug, _: SessionId) -> Result<(), StoreError> {
            Ok(())
        }
        async fn release_active(&self, _: &AgentSlug) -> Result<(), StoreError> {
            Ok(())
        }
    }

    fn answer(session: SessionId) -> FinalAnswer {
        let document = DocumentView {
            markdown: String::new(),
            answer: "## Scope\nISA 315 applies.\n\n## Procedures\nPerform walkthroughs.".into(),
            citations: vec![Citation {
                evidence_id: EvidenceId::new("ip_9").unwrap(),
                claim: "applies".into(),
            }],
            sub_queries: vec!["scope of ISA 315".into()],
            evidence_ids: vec![EvidenceId::new("ip_1").unwrap(), EvidenceId::new("ip_2").unwrap()],
            open_issues: vec![],
        };
        FinalAnswer::from_document(session, "What does ISA 315 require?", 0, &document)
    }

    #[test]
    fn context_collects_sections_and_seen_ids() {
        let session = SessionId::new_random();
        let ctx = FollowUpContext::from_answer(&answer(session));
        assert_eq!(ctx.follow_up_number, 1);
        assert_eq!(ctx.sections.len(), 2);
        assert_eq!(ctx.sections[1].id.as_str(), "s2");
        assert_eq!(ctx.sections[1].heading, "Procedures");
        assert_eq!(ctx.seen_evidence.len(), 3);
        assert!(ctx.has_seen(&EvidenceId::new("ip_9").unwrap()));
    }

    #[test]
    fn seen_evidence_accumulates_along_a_chain() {
        let id = |s: &str| EvidenceId::new(s).unwrap();
        let first = answer(SessionId::new_random()).with_seen_evidence([id("ip_5")]);
        let context = FollowUpContext::from_answer(&first);

        // The follow-up cites one new source but saw others.
        let mut second = answer(SessionId::new_random());
        second.citations.clear();
        second.evidence_ids = vec![id("ip_7")];
        second.seen_evidence_ids = vec![id("ip_7")];
        let second = second.with_seen_evidence(context.seen_evidence.iter().cloned().chain([id("ip_6")]));
        let context = FollowUpContext::from_answer(&second);

        for seen in ["ip_1", "ip_2", "ip_5", "ip_6", "ip_7", "ip_9"] {
            assert!(context.has_seen(&id(seen)), "{seen} should be seen");
        }
        assert!(!context.has_seen(&id("ip_3")));
    }

    #[test]
    fn answers_written_before_seen_ids_existed_still_load() {
        let mut raw = serde_json::to_value(answer(SessionId::new_random())).unwrap();
        raw.as_object_mut().unwrap().remove("seen_evidence_ids");
        let answer: FinalAnswer = serde_json::from_value(raw).unwrap();
        assert!(FollowUpContext::from_answer(&answer).has_seen(&EvidenceId::new("ip_1").unwrap()));
    }

    #[test]
    fn long_sections_are_excerpted() {
        let mut a = answer(SessionId::new_random());
        a.answer = format!("## Long\n{}", "word ".repeat(400));
        let ctx = FollowUpContext::from_answer(&a);
        assert!(ctx.sections[0].excerpt.ends_with('…'));
        assert!(ctx.sections[0].excerpt.chars().count() <= 401);
    }

    #[tokio::test]
    async fn loader_round_trips_a_saved_answer() {
        let store = Arc::new(Answers::default());
        let session = SessionId::new_random();
        store.save_answer(&answer(session)).await.unwrap();
        let ctx = FollowUpContextLoader::new(store).load(session).await.expect("context");
        assert_eq!(ctx.previous_session_id, session);
    }

    #[tokio::test]
    async fn missing_or_malformed_answers_degrade_to_none() {
        let store = Arc::new(Answers::default());
        let loader = FollowUpContextLoader::new(store.clone());
        let session = SessionId::new_random();
        assert!(loader.load(session).await.is_none());

        store.0.lock().unwrap().insert(session, "{not json".into());
        assert!(loader.load(session).await.is_none());

        let other = answer(SessionId::new_random());
        store
            .0
            .lock()
            .unwrap()
            .insert(session, serde_json::to_string(&other).unwrap());
        assert!(loader.load(session).await.is_none());
    }
}
