//! The pipeline scheduler.
//!
//! [`PipelineOrchestrator::run`] starts a run and [`PipelineOrchestrator::resume`]
//! continues a paused one. Both drive stages in ascending order until the run
//! pauses, completes, or fails, and both return a [`RunExit`] stating which.
//!
//! ## Exit contract
//!
//! | Exit | Active-run marker | Tool channel |
//! |------|-------------------|--------------|
//! | paused | kept, so `resume` can find the run | closed |
//! | completed | released | closed |
//! | failed after start | released | closed |
//! | connection failure | untouched | never opened |
//!
//! A pause always returns control: the loop never continues past a pause
//! point within one invocation, whatever the caller does next.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use pipeline::cost::{CostTracker, ModelPricing};
use pipeline::follow_up::{FinalAnswer, FollowUpContext, FollowUpContextLoader};
use pipeline::intent::UserIntent;
use pipeline::lifecycle::{LifecycleEvent, LifecycleObserver};
use pipeline::pause::{PauseMessage, PauseMessageFormatter};
use pipeline::persistence::{StateStore, StoreError};
use pipeline::shapes::{self, DocumentView, StageView};
use pipeline::stage::{PipelineDefinition, RepairUnit, StageDefinition, StageResult};
use pipeline::state::PipelineState;
use pipeline::tools::{ToolBridge, ToolError};
use pipeline::{
    AgentSlug, CostBudget, EvidenceId, PipelineError, SessionId, StageId, TokenCost, VerificationScore,
};
use tracing::Instrument;

use crate::executor::StageExecutor;
use crate::handler::StageInput;
use crate::observers::TracingObserver;
use crate::tool_lifecycle::ToolLifecycleManager;

/// Per-agent settings.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Owner of the active-run marker.
    pub agent: AgentSlug,
    pub pricing: ModelPricing,
    /// `None` means unlimited.
    pub budget: Option<CostBudget>,
}

/// Why an invocation ended without pausing or completing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// The tool connection could not be opened.
    ConnectionFailure,
    /// The cost budget was reached at a stage boundary.
    BudgetExceeded,
    /// A stage handler failed.
    StageFailure,
    /// The user aborted at a pause.
    Cancelled,
    /// `resume` found no active run for the agent.
    NoActiveSession,
    /// `resume` found a run that is not paused.
    NotPaused,
    /// State could not be read or written.
    Persistence,
    /// The definition or handlers are invalid.
    Configuration,
}

impl ExitReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ConnectionFailure => "connection_failure",
            Self::BudgetExceeded => "budget_exceeded",
            Self::StageFailure => "stage_failure",
            Self::Cancelled => "cancelled",
            Self::NoActiveSession => "no_active_session",
            Self::NotPaused => "not_paused",
            Self::Persistence => "persistence",
            Self::Configuration => "configuration",
        }
    }
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How an invocation ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RunExit {
    Paused {
        session: SessionId,
        stage: StageId,
        message: PauseMessage,
    },
    Completed {
        session: SessionId,
        document: String,
        answer: FinalAnswer,
        total_cost: TokenCost,
    },
    Failed {
        session: Option<SessionId>,
        reason: ExitReason,
        diagnostic: String,
    },
}

impl RunExit {
    pub fn session(&self) -> Option<SessionId> {
        match self {
            Self::Paused { session, .. } | Self::Completed { session, .. } => Some(*session),
            Self::Failed { session, .. } => *session,
        }
    }

    pub fn is_paused(&self) -> bool {
        matches!(self, Self::Paused { .. })
    }

    /// The failure reason, if any.
    pub fn failure(&self) -> Option<ExitReason> {
        match self {
            Self::Failed { reason, .. } => Some(*reason),
            _ => None,
        }
    }
}

/// A condition that stops the stage loop.
#[derive(Debug)]
struct Halt {
    reason: ExitReason,
    diagnostic: String,
    budget: Option<(TokenCost, CostBudget)>,
}

impl Halt {
    fn new(reason: ExitReason, diagnostic: impl Into<String>) -> Self {
        Self {
            reason,
            diagnostic: diagnostic.into(),
            budget: None,
        }
    }

    fn persistence(error: &StoreError) -> Self {
        tracing::error!(error = ?error, "state could not be persisted");
        Self::new(ExitReason::Persistence, "run state could not be saved")
    }
}

/// Mutable context of one invocation.
struct Invocation<'a> {
    definition: &'a PipelineDefinition,
    follow_up: Option<FollowUpContext>,
    bridge: ToolBridge,
    cost: CostTracker,
    /// Consumed by the first stage executed.
    guidance: Option<String>,
    skip: BTreeSet<StageId>,
}

/// Runs pipelines for one agent.
pub struct PipelineOrchestrator {
    executor: StageExecutor,
    tools: ToolLifecycleManager,
    store: Arc<dyn StateStore>,
    observer: Arc<dyn LifecycleObserver>,
    formatter: PauseMessageFormatter,
    settings: OrchestratorSettings,
}

impl PipelineOrchestrator {
    pub fn new(
        executor: StageExecutor,
        tools: ToolLifecycleManager,
        store: Arc<dyn StateStore>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            executor,
            tools,
            store,
            observer: Arc::new(TracingObserver),
            formatter: PauseMessageFormatter::new(),
            settings,
        }
    }

    /// Replaces the default tracing observer.
    pub fn with_observer(mut self, observer: Arc<dyn LifecycleObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    /// Starts a new run for `question`.
    ///
    /// The tool connection is opened before any state exists, so a connection
    /// failure leaves no trace besides the `ConnectionFailed` event.
    #[tracing::instrument(skip_all, fields(agent = %self.settings.agent))]
    pub async fn run(
        &self,
        question: &str,
        definition: &PipelineDefinition,
        follow_up: Option<FollowUpContext>,
    ) -> RunExit {
        if let Err(e) = self.executor.validate(definition) {
            return self.reject(None, ExitReason::Configuration, e.to_string());
        }
        if question.trim().is_empty() {
            return self.reject(None, ExitReason::Configuration, "the question is empty");
        }

        let outcome = self
            .tools
            .scoped(|bridge| async move {
                let session = SessionId::new_random();
                let mut state =
                    PipelineState::new(session, question.trim(), definition).with_agent(self.settings.agent.clone());
                if let Some(ctx) = &follow_up {
                    state = state.with_previous_session(ctx.previous_session_id);
                }
                if let Err(e) = self.acquire(&state).await {
                    let halt = Halt::persistence(&e);
                    return self.reject(Some(session), halt.reason, halt.diagnostic);
                }
                tracing::info!(session = %session, follow_up = follow_up.is_some(), "run started");

                let invocation = Invocation {
                    definition,
                    follow_up,
                    bridge,
                    cost: CostTracker::new(self.settings.pricing, self.settings.budget),
                    guidance: None,
                    skip: BTreeSet::new(),
                };
                self.drive(state, invocation)
                    .instrument(tracing::info_span!("session", session_id = %session))
                    .await
            })
            .await;

        outcome.unwrap_or_else(|e| self.connection_failed(None, e))
    }

    /// Continues the agent's paused run with the user's `response`.
    ///
    /// State is reloaded from the store; follow-up context is rebuilt from the
    /// state's own `previous_session_id`.
    #[tracing::instrument(skip_all, fields(agent = %self.settings.agent))]
    pub async fn resume(&self, response: &str, definition: &PipelineDefinition) -> RunExit {
        if let Err(e) = self.executor.validate(definition) {
            return self.reject(None, ExitReason::Configuration, e.to_string());
        }
        let agent = &self.settings.agent;
        let session = match self.store.active_session(agent).await {
            Ok(Some(session)) => session,
            Ok(None) => {
                return self.reject(None, ExitReason::NoActiveSession, format!("agent '{agent}' has no paused run"))
            }
            Err(e) => {
                let halt = Halt::persistence(&e);
                return self.reject(None, halt.reason, halt.diagnostic);
            }
        };
        let state = match self.store.load(session).await {
            Ok(Some(state)) => state,
            Ok(None) => {
                return self.reject(
                    Some(session),
                    ExitReason::NoActiveSession,
                    format!("run {session} has no saved state"),
                )
            }
            Err(e) => {
                let halt = Halt::persistence(&e);
                return self.reject(Some(session), halt.reason, halt.diagnostic);
            }
        };
        if !state.is_paused() {
            return self.reject(Some(session), ExitReason::NotPaused, format!("run {session} is not paused"));
        }
        if let Some(missing) = state.plan().iter().find(|s| definition.stage(**s).is_none()) {
            let e = PipelineError::UnknownStage { stage: *missing };
            return self.reject(Some(session), ExitReason::Configuration, e.to_string());
        }

        let intent = UserIntent::parse(response, definition, state.current_stage());
        if intent.abort {
            return self.cancel(state, response).await;
        }
        if !intent.skip.is_empty() {
            tracing::info!(skip = ?intent.skip, "user asked to skip stages");
        }

        let follow_up = match state.previous_session_id() {
            Some(previous) => FollowUpContextLoader::new(self.store.clone()).load(previous).await,
            None => None,
        };
        let cost = CostTracker::from_state(&state, self.settings.pricing, self.settings.budget);

        let outcome = self
            .tools
            .scoped(|bridge| async move {
                let state = match state.resumed(response) {
                    Ok(state) => state,
                    Err(e) => return self.reject(Some(session), ExitReason::NotPaused, e.to_string()),
                };
                if let Err(e) = self.store.save(&state).await {
                    return self.fail(state, Halt::persistence(&e)).await;
                }
                tracing::info!(session = %session, "run resumed");
                let invocation = Invocation {
                    definition,
                    follow_up,
                    bridge,
                    cost,
                    guidance: intent.guidance,
                    skip: intent.skip,
                };
                self.drive(state, invocation)
                    .instrument(tracing::info_span!("session", session_id = %session))
                    .await
            })
            .await;

        outcome.unwrap_or_else(|e| self.connection_failed(Some(session), e))
    }

    // -- loop ---------------------------------------------------------------

    async fn drive(&self, mut state: PipelineState, mut invocation: Invocation<'_>) -> RunExit {
        match self.advance(&mut state, &mut invocation).await {
            Ok(Some(message)) => {
                let session = state.session_id();
                let stage = message.stage;
                self.emit(LifecycleEvent::Paused {
                    session,
                    stage,
                    message: message.clone(),
                });
                RunExit::Paused { session, stage, message }
            }
            Ok(None) => self.complete(state, &invocation).await,
            Err(halt) => self.fail(state, halt).await,
        }
    }

    /// Runs stages until a pause (returned) or the end of the plan.
    async fn advance(
        &self,
        state: &mut PipelineState,
        invocation: &mut Invocation<'_>,
    ) -> Result<Option<PauseMessage>, Halt> {
        while let Some(stage_id) = state.current_stage() {
            self.check_budget(invocation)?;
            let definition = invocation.definition;
            let stage = definition.stage(stage_id).ok_or_else(|| {
                Halt::new(
                    ExitReason::Configuration,
                    PipelineError::UnknownStage { stage: stage_id }.to_string(),
                )
            })?;

            if invocation.skip.contains(&stage_id) {
                let reason = "skipped at the user's request";
                *state = state.stage_completed(stage_id, 0, StageResult::pass_through(stage, reason), TokenCost::zero());
                self.checkpoint(state).await?;
                self.emit(LifecycleEvent::StageSkipped {
                    session: state.session_id(),
                    stage: stage_id,
                    name: stage.name.clone(),
                    reason: reason.to_string(),
                });
                continue;
            }

            self.run_stage(state, invocation, stage, 0, None).await?;

            if stage.pause_after {
                return self.pause(state, invocation, stage).await.map(Some);
            }
            if let Some(unit) = definition.repair_unit_ending_at(stage_id) {
                self.repair(state, invocation, unit).await?;
            }
        }
        Ok(None)
    }

    /// Re-runs `unit` while its last stage asks for repair, up to the cap.
    async fn repair(
        &self,
        state: &mut PipelineState,
        invocation: &mut Invocation<'_>,
        unit: &RepairUnit,
    ) -> Result<(), Halt> {
        let Some(last) = unit.last_stage() else {
            return Ok(());
        };
        let mut best: Option<RepairRound> = None;
        loop {
            let (needs_repair, feedback) = match state.output(last) {
                Some(outcome) => (outcome.needs_repair(), outcome.feedback(&unit.feedback_field)),
                None => return Ok(()),
            };
            if !needs_repair {
                return Ok(());
            }
            let done = state.repair_iterations(&unit.name);
            let round = RepairRound::capture(state, invocation.definition, unit, done);
            if best.as_ref().map_or(true, |b| round.score > b.score) {
                best = Some(round);
            }
            if done >= unit.max_iterations {
                if let Some(best) = best.filter(|b| b.iteration != done) {
                    tracing::info!(
                        unit = %unit.name,
                        round = best.iteration,
                        score = %best.score,
                        "keeping the best-verified repair round"
                    );
                    *state = state.restore_repair_round(unit.name.clone(), best.iteration, best.outputs);
                }
                *state = state.repair_exhausted(unit.name.clone(), last, done);
                self.checkpoint(state).await?;
                self.emit(LifecycleEvent::RepairExhausted {
                    session: state.session_id(),
                    unit: unit.name.clone(),
                    iterations: done,
                });
                return Ok(());
            }

            let iteration = done + 1;
            *state = state.repair_iteration(unit.name.clone(), iteration, feedback.clone());
            self.checkpoint(state).await?;
            self.emit(LifecycleEvent::RepairIteration {
                session: state.session_id(),
                unit: unit.name.clone(),
                iteration,
            });
            for member in &unit.stages {
                self.check_budget(invocation)?;
                let stage = invocation.definition.stage(*member).ok_or_else(|| {
                    Halt::new(
                        ExitReason::Configuration,
                        PipelineError::UnknownStage { stage: *member }.to_string(),
                    )
                })?;
                self.run_stage(state, invocation, stage, iteration, feedback.as_deref()).await?;
            }
        }
    }

    async fn run_stage(
        &self,
        state: &mut PipelineState,
        invocation: &mut Invocation<'_>,
        stage: &StageDefinition,
        iteration: u32,
        repair_feedback: Option<&str>,
    ) -> Result<(), Halt> {
        *state = state.stage_started(stage.id, iteration);
        self.checkpoint(state).await?;
        self.emit(LifecycleEvent::StageStarted {
            session: state.session_id(),
            stage: stage.id,
            name: stage.name.clone(),
            iteration,
        });

        let guidance = invocation.guidance.take();
        let outcome = {
            let input = StageInput {
                stage,
                pipeline: invocation.definition,
                question: state.question(),
                guidance: guidance.as_deref(),
                prior: state.outputs(),
                follow_up: invocation.follow_up.as_ref(),
                repair_feedback,
                iteration,
            };
            self.executor.execute(&input, &invocation.bridge).await
        };

        match outcome {
            Ok(result) => {
                let cost = invocation.cost.record_stage(stage.id, result.usage);
                let summary = result.summary.clone();
                *state = state.stage_completed(stage.id, iteration, result, cost);
                self.checkpoint(state).await?;
                self.emit(LifecycleEvent::StageCompleted {
                    session: state.session_id(),
                    stage: stage.id,
                    name: stage.name.clone(),
                    summary,
                    cost,
                });
                Ok(())
            }
            Err(e) => {
                tracing::error!(stage = %stage.name, error = ?e, "stage failed");
                *state = state.stage_failed(stage.id, iteration, e.to_string());
                Err(Halt::new(ExitReason::StageFailure, e.diagnostic()))
            }
        }
    }

    async fn pause(
        &self,
        state: &mut PipelineState,
        invocation: &Invocation<'_>,
        stage: &StageDefinition,
    ) -> Result<PauseMessage, Halt> {
        *state = state.pause_requested(stage.id);
        self.checkpoint(state).await?;

        let definition = invocation.definition;
        let next = definition.next_after(stage.id).and_then(|id| definition.stage(id));
        let result = state
            .output(stage.id)
            .cloned()
            .unwrap_or_else(|| StageResult::nothing_to_do("no output was recorded"));
        let message = self.formatter.format(stage, &result, next);
        *state = state.pause_formatted(stage.id, message.path);
        self.checkpoint(state).await?;
        Ok(message)
    }

    fn check_budget(&self, invocation: &Invocation<'_>) -> Result<(), Halt> {
        match invocation.cost.check_budget() {
            Ok(()) => Ok(()),
            Err(PipelineError::BudgetExceeded { accumulated, limit }) => Err(Halt {
                reason: ExitReason::BudgetExceeded,
                diagnostic: format!("cost budget of {limit} reached ({accumulated} spent)"),
                budget: Some((accumulated, limit)),
            }),
            Err(e) => Err(Halt::new(ExitReason::Configuration, e.to_string())),
        }
    }

    // -- exits --------------------------------------------------------------

    async fn complete(&self, state: PipelineState, invocation: &Invocation<'_>) -> RunExit {
        let session = state.session_id();
        let definition = invocation.definition;
        let last = definition.last();
        let document = match (state.output(last), definition.stage(last)) {
            (Some(result), Some(stage)) => match shapes::normalize(stage.output, &result.data).view {
                StageView::Document(document) => document,
                _ => DocumentView {
                    markdown: result.text.clone(),
                    answer: result.text.clone(),
                    ..DocumentView::default()
                },
            },
            _ => DocumentView::default(),
        };
        let follow_up_number = invocation.follow_up.as_ref().map_or(0, |f| f.follow_up_number);
        let answer = FinalAnswer::from_document(session, state.question(), follow_up_number, &document)
            .with_seen_evidence(presented_evidence(&state, invocation));
        if let Err(e) = self.store.save_answer(&answer).await {
            tracing::error!(error = ?e, "answer document could not be saved; follow-up runs will start fresh");
        }
        self.release().await;

        let total_cost = state.total_cost();
        tracing::info!(total_cost = %total_cost, usage = ?state.total_usage(), "run completed");
        self.emit(LifecycleEvent::Completed {
            session,
            document: document.markdown.clone(),
            total_cost,
        });
        RunExit::Completed {
            session,
            document: document.markdown,
            answer,
            total_cost,
        }
    }

    async fn fail(&self, state: PipelineState, halt: Halt) -> RunExit {
        let session = state.session_id();
        let state = state.halted(halt.reason.as_str());
        if let Err(e) = self.store.save(&state).await {
            tracing::warn!(error = ?e, "halted state could not be saved");
        }
        self.release().await;
        match halt.budget {
            Some((accumulated, limit)) => self.emit(LifecycleEvent::BudgetExceeded {
                session,
                accumulated,
                limit,
            }),
            None => self.emit(LifecycleEvent::Error {
                session: Some(session),
                reason: halt.reason.to_string(),
                diagnostic: halt.diagnostic.clone(),
            }),
        }
        RunExit::Failed {
            session: Some(session),
            reason: halt.reason,
            diagnostic: halt.diagnostic,
        }
    }

    async fn cancel(&self, state: PipelineState, response: &str) -> RunExit {
        let session = state.session_id();
        let state = match state.resumed(response) {
            Ok(state) => state,
            Err(e) => return self.reject(Some(session), ExitReason::NotPaused, e.to_string()),
        };
        tracing::info!(session = %session, "run cancelled by the user");
        self.fail(state, Halt::new(ExitReason::Cancelled, "the run was cancelled")).await
    }

    fn connection_failed(&self, session: Option<SessionId>, error: ToolError) -> RunExit {
        tracing::error!(error = ?error, "tool connection failed");
        self.emit(LifecycleEvent::ConnectionFailed {
            reason: error.to_string(),
        });
        RunExit::Failed {
            session,
            reason: ExitReason::ConnectionFailure,
            diagnostic: error.to_string(),
        }
    }

    /// Fails without touching state or the active-run marker.
    fn reject(&self, session: Option<SessionId>, reason: ExitReason, diagnostic: impl Into<String>) -> RunExit {
        let diagnostic = diagnostic.into();
        tracing::warn!(reason = %reason, "{diagnostic}");
        self.emit(LifecycleEvent::Error {
            session,
            reason: reason.to_string(),
            diagnostic: diagnostic.clone(),
        });
        RunExit::Failed {
            session,
            reason,
            diagnostic,
        }
    }

    // -- persistence helpers --------------------------------------------------

    async fn acquire(&self, state: &PipelineState) -> Result<(), StoreError> {
        let agent = &self.settings.agent;
        if let Ok(Some(previous)) = self.store.active_session(agent).await {
            tracing::warn!(previous = %previous, "superseding the agent's unfinished run");
        }
        self.store.save(state).await?;
        self.store.set_active(agent, state.session_id()).await
    }

    async fn checkpoint(&self, state: &PipelineState) -> Result<(), Halt> {
        self.store.save(state).await.map_err(|e| Halt::persistence(&e))
    }

    async fn release(&self) {
        if let Err(e) = self.store.release_active(&self.settings.agent).await {
            tracing::warn!(error = ?e, "active-run marker could not be released");
        }
    }

    fn emit(&self, event: LifecycleEvent) {
        self.observer.on_event(&event);
    }
}

/// Outputs of one pass through a repair unit and how well they verified.
struct RepairRound {
    iteration: u32,
    score: VerificationScore,
    outputs: BTreeMap<StageId, StageResult>,
}

impl RepairRound {
    fn capture(state: &PipelineState, definition: &PipelineDefinition, unit: &RepairUnit, iteration: u32) -> Self {
        let score = unit
            .last_stage()
            .and_then(|last| Some((definition.stage(last)?, state.output(last)?)))
            .and_then(|(stage, result)| match shapes::normalize(stage.output, &result.data).view {
                StageView::Verification(view) => Some(view.score),
                _ => None,
            })
            .unwrap_or_else(VerificationScore::zero);
        let outputs = unit
            .stages
            .iter()
            .filter_map(|id| Some((*id, state.output(*id)?.clone())))
            .collect();
        Self {
            iteration,
            score,
            outputs,
        }
    }
}

/// Evidence the run put in front of the model, plus everything earlier runs
/// of the chain had already shown.
fn presented_evidence(state: &PipelineState, invocation: &Invocation<'_>) -> BTreeSet<EvidenceId> {
    let mut seen: BTreeSet<EvidenceId> = invocation
        .follow_up
        .as_ref()
        .map(|f| f.seen_evidence.clone())
        .unwrap_or_default();
    for (id, result) in state.outputs() {
        let Some(stage) = invocation.definition.stage(*id) else {
            continue;
        };
        if let StageView::Evidence(view) = shapes::normalize(stage.output, &result.data).view {
            seen.extend(view.items.into_iter().map(|item| item.id));
        }
    }
    seen
}
