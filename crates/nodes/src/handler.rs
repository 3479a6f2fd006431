//! Stage handler traits and the input every handler receives.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use pipeline::evidence::{Citation, Evidence};
use pipeline::follow_up::FollowUpContext;
use pipeline::llm::LlmError;
use pipeline::shapes::{self, AnswerView, Normalized, StageView, VerificationView};
use pipeline::stage::{OutputKind, PipelineDefinition, StageDefinition, StageKind, StageResult};
use pipeline::tokens::BudgetError;
use pipeline::tools::{ToolBridge, ToolError};
use pipeline::{RetryPolicy, StageId};
use thiserror::Error;

/// Failure of one stage execution.
///
/// Recoverable conditions (malformed model output, empty evidence, per-call
/// tool failures) are handled inside the handlers; a `StageError` halts the run.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("stage '{stage}': model call failed: {source}")]
    Llm {
        stage: String,
        #[source]
        source: LlmError,
    },

    #[error("stage '{stage}': {source}")]
    Tool {
        stage: String,
        #[source]
        source: ToolError,
    },

    #[error("stage '{stage}': {source}")]
    Budget {
        stage: String,
        #[source]
        source: BudgetError,
    },

    #[error("no handler registered for stage {stage}")]
    MissingHandler { stage: StageId },

    #[error("handler for stage '{stage}' is {actual:?} but the stage is declared {declared:?}")]
    KindMismatch {
        stage: String,
        declared: StageKind,
        actual: StageKind,
    },
}

impl StageError {
    pub fn retry_policy(&self) -> RetryPolicy {
        match self {
            Self::Llm { source, .. } => source.retry_policy(),
            Self::Tool { source, .. } => source.retry_policy(),
            _ => RetryPolicy::NonRetryable,
        }
    }

    /// Short, user-safe description.
    pub fn diagnostic(&self) -> String {
        match self {
            Self::Llm { stage, .. } => format!("the model call for '{stage}' failed"),
            Self::Tool { stage, source } => match source.tool() {
                Some(tool) => format!("tool '{tool}' failed during '{stage}'"),
                None => format!("the tool connection failed during '{stage}'"),
            },
            Self::Budget { stage, .. } => format!("the prompt for '{stage}' does not fit the context window"),
            Self::MissingHandler { stage } => format!("stage {stage} has no handler"),
            Self::KindMismatch { stage, .. } => format!("stage '{stage}' has the wrong handler kind"),
        }
    }
}

/// Everything a handler may read.
#[derive(Debug, Clone, Copy)]
pub struct StageInput<'a> {
    pub stage: &'a StageDefinition,
    pub pipeline: &'a PipelineDefinition,
    pub question: &'a str,
    /// The user's latest pause response, for the first stage after a resume.
    pub guidance: Option<&'a str>,
    /// Latest output of every stage run so far.
    pub prior: &'a BTreeMap<StageId, StageResult>,
    pub follow_up: Option<&'a FollowUpContext>,
    /// Feedback from the previous repair round.
    pub repair_feedback: Option<&'a str>,
    /// 0 on the first pass, the repair round otherwise.
    pub iteration: u32,
}

impl<'a> StageInput<'a> {
    /// The latest earlier stage producing `kind`, with its result.
    pub fn prior_of(&self, kind: OutputKind) -> Option<(&'a StageDefinition, &'a StageResult)> {
        self.pipeline
            .stages()
            .iter()
            .rev()
            .filter(|s| s.output == kind && s.id < self.stage.id)
            .find_map(|s| self.prior.get(&s.id).map(|r| (s, r)))
    }

    /// Normalised view of the latest earlier stage producing `kind`.
    pub fn view_of(&self, kind: OutputKind) -> Option<Normalized> {
        self.prior_of(kind).map(|(def, result)| shapes::normalize(def.output, &result.data))
    }

    /// Sub-queries to search for.
    ///
    /// Falls back to the question itself when analysis was skipped or produced
    /// nothing usable. An analysis that parsed but listed no sub-queries yields
    /// none.
    pub fn sub_queries(&self) -> Vec<String> {
        match self.view_of(OutputKind::Analysis).map(|n| n.view) {
            Some(StageView::Analysis(view)) => view.sub_queries.into_iter().map(|q| q.query).collect(),
            _ if self.question.trim().is_empty() => Vec::new(),
            _ => vec![self.question.trim().to_string()],
        }
    }

    /// Evidence retrieved by an earlier stage.
    pub fn evidence(&self) -> Vec<Evidence> {
        match self.view_of(OutputKind::Evidence).map(|n| n.view) {
            Some(StageView::Evidence(view)) => view.items,
            _ => Vec::new(),
        }
    }

    /// The synthesised answer, if it was parsed.
    pub fn answer(&self) -> Option<AnswerView> {
        match self.view_of(OutputKind::Answer)?.view {
            StageView::Answer(view) => Some(view),
            _ => None,
        }
    }

    /// The verification outcome, if any.
    pub fn verification(&self) -> Option<VerificationView> {
        match self.view_of(OutputKind::Verification)?.view {
            StageView::Verification(view) => Some(view),
            _ => None,
        }
    }

    /// Citations of the answer.
    pub fn citations(&self) -> Vec<Citation> {
        self.answer().map(|a| a.citations).unwrap_or_default()
    }
}

/// A model-driven stage.
#[async_trait]
pub trait ModelHandler: Send + Sync {
    async fn execute(&self, input: &StageInput<'_>) -> Result<StageResult, StageError>;
}

/// A tool-driven stage.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn execute(&self, input: &StageInput<'_>, tools: &ToolBridge) -> Result<StageResult, StageError>;
}

/// A pure, deterministic stage.
pub trait PureHandler: Send + Sync {
    fn execute(&self, input: &StageInput<'_>) -> StageResult;
}

/// A registered handler.
#[derive(Clone)]
pub enum Handler {
    Model(Arc<dyn ModelHandler>),
    Tool(Arc<dyn ToolHandler>),
    Pure(Arc<dyn PureHandler>),
}

impl Handler {
    pub fn kind(&self) -> StageKind {
        match self {
            Self::Model(_) => StageKind::Model,
            Self::Tool(_) => StageKind::Tool,
            Self::Pure(_) => StageKind::Pure,
        }
    }
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Handler::{:?}", self.kind())
    }
}

/// One-line summary of `data` produced by a stage of `kind`.
pub(crate) fn summarize(kind: OutputKind, data: &serde_json::Value) -> String {
    match shapes::normalize(kind, data).view {
        StageView::Analysis(v) => format!("{} sub-queries", v.sub_queries.len()),
        StageView::Calibration(v) => format!("{} web results, {} warnings", v.hits.len(), v.warnings.len()),
        StageView::Evidence(v) => format!(
            "{} evidence items ({} previously seen, {} duplicates dropped)",
            v.items.len(),
            v.dropped_seen,
            v.dropped_duplicates
        ),
        StageView::Answer(v) => format!("answer with {} sections, {} citations", v.sections.len(), v.citations.len()),
        StageView::Verification(v) => format!(
            "score {}, {}",
            v.score,
            if v.needs_repair { "repair needed" } else { "passed" }
        ),
        StageView::Document(v) => format!("document with {} sources", v.evidence_ids.len()),
        StageView::PassThrough { reason } => format!("skipped: {reason}"),
        StageView::NothingToDo { reason } => format!("nothing to do: {reason}"),
        StageView::Summary { text } => text,
        StageView::Unrecognized => "unrecognised output".to_string(),
    }
}
