//! Immutable, event-sourced pipeline state.
//!
//! [`PipelineState`] is the single source of truth for a run's progress. Every
//! mutating operation takes `&self` and returns a new instance; the receiver is
//! never changed. Derived flags (`is_paused`, `is_complete`, `current_stage`,
//! `total_cost`) are computed from the append-only event log rather than stored,
//! so a snapshot reloaded after a crash answers them identically.
//!
//! ## Persistence
//!
//! [`PipelineState::to_json`] writes a self-describing [`StateSnapshot`]
//! (format tag, version, identity fields, plan, events, outputs). Reading it back
//! with [`PipelineState::from_json`] is lossless.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::shapes::NormalizationPath;
use crate::stage::{Disposition, PipelineDefinition, StageResult};
use crate::{AgentSlug, PipelineError, RepairUnitName, SessionId, StageId, Timestamp, TokenCost, Usage};

/// Format tag written into every snapshot.
pub const SNAPSHOT_FORMAT: &str = "stagewright.pipeline-state";

/// Current snapshot schema version.
pub const SNAPSHOT_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// One entry of the append-only event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    /// A stage began executing. `iteration` is 0 for the first pass and the
    /// repair round number otherwise.
    StageStarted {
        stage: StageId,
        iteration: u32,
        at: Timestamp,
    },
    /// A stage finished and its output was stored.
    StageCompleted {
        stage: StageId,
        iteration: u32,
        usage: Usage,
        cost: TokenCost,
        disposition: Disposition,
        at: Timestamp,
    },
    /// A stage handler returned an error.
    StageFailed {
        stage: StageId,
        iteration: u32,
        error: String,
        at: Timestamp,
    },
    /// The run suspended after `stage` for human input.
    PauseRequested { stage: StageId, at: Timestamp },
    /// The user answered the pause raised after `stage`.
    Resumed {
        stage: StageId,
        response: String,
        at: Timestamp,
    },
    /// Records which normalisation path produced the pause message text.
    PauseFormatted {
        stage: StageId,
        path: NormalizationPath,
        at: Timestamp,
    },
    /// A repair round began.
    RepairIteration {
        unit: RepairUnitName,
        iteration: u32,
        #[serde(default)]
        feedback: Option<String>,
        at: Timestamp,
    },
    /// At the repair cap, the unit's outputs were reset to those of an earlier
    /// round that verified better than the last one.
    RepairRoundRestored {
        unit: RepairUnitName,
        iteration: u32,
        stages: Vec<StageId>,
        at: Timestamp,
    },
    /// The repair loop reached its cap; the unit's last output was flagged.
    RepairExhausted {
        unit: RepairUnitName,
        stage: StageId,
        iterations: u32,
        at: Timestamp,
    },
    /// The run stopped without completing (budget, cancellation, failure).
    Halted { reason: String, at: Timestamp },
}

// ---------------------------------------------------------------------------
// Batch commands
// ---------------------------------------------------------------------------

/// A host-issued state command, applied through [`PipelineState::apply_batch`].
#[derive(Debug, Clone, PartialEq)]
pub enum StateCommand {
    /// Record a stage as completed with the given result.
    CompleteStage { stage: StageId, result: StageResult },
    /// Answer the pending pause.
    Resume { response: String },
    /// Mark a stage as started.
    StartStage { stage: StageId },
}

/// Outcome of [`PipelineState::apply_batch`].
#[derive(Debug, Clone)]
pub struct BatchOutcome {
    /// State after every applied command.
    pub state: PipelineState,
    /// Number of commands applied.
    pub applied: usize,
    /// Commands not applied because the batch reached a pause point.
    pub deferred: Vec<StateCommand>,
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Durable progress of one run.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineState {
    session_id: SessionId,
    agent_slug: Option<AgentSlug>,
    previous_session_id: Option<SessionId>,
    question: String,
    plan: Vec<StageId>,
    created_at: Timestamp,
    events: Vec<PipelineEvent>,
    outputs: BTreeMap<StageId, StageResult>,
}

impl PipelineState {
    /// Creates the initial state for a run of `definition` answering `question`.
    pub fn new(session_id: SessionId, question: impl Into<String>, definition: &PipelineDefinition) -> Self {
        Self {
            session_id,
            agent_slug: None,
            previous_session_id: None,
            question: question.into(),
            plan: definition.stage_ids(),
            created_at: Timestamp::now(),
            events: Vec::new(),
            outputs: BTreeMap::new(),
        }
    }

    /// Returns a copy owned by `agent`.
    pub fn with_agent(&self, agent: AgentSlug) -> Self {
        let mut next = self.clone();
        next.agent_slug = Some(agent);
        next
    }

    /// Returns a copy that continues the completed run `previous`.
    pub fn with_previous_session(&self, previous: SessionId) -> Self {
        let mut next = self.clone();
        next.previous_session_id = Some(previous);
        next
    }

    fn push(&self, event: PipelineEvent) -> Self {
        let mut next = self.clone();
        next.events.push(event);
        next
    }

    // -- mutations (all return a new instance) -----------------------------

    /// Appends `stage_started`.
    pub fn stage_started(&self, stage: StageId, iteration: u32) -> Self {
        self.push(PipelineEvent::StageStarted {
            stage,
            iteration,
            at: Timestamp::now(),
        })
    }

    /// Stores `result` as the output of `stage` and appends `stage_completed`.
    ///
    /// A later completion of the same stage (repair round) replaces the stored
    /// output; the event log keeps every completion.
    pub fn stage_completed(&self, stage: StageId, iteration: u32, result: StageResult, cost: TokenCost) -> Self {
        let mut next = self.push(PipelineEvent::StageCompleted {
            stage,
            iteration,
            usage: result.usage,
            cost,
            disposition: result.disposition.clone(),
            at: Timestamp::now(),
        });
        next.outputs.insert(stage, result);
        next
    }

    /// Appends `stage_failed`.
    pub fn stage_failed(&self, stage: StageId, iteration: u32, error: impl Into<String>) -> Self {
        self.push(PipelineEvent::StageFailed {
            stage,
            iteration,
            error: error.into(),
            at: Timestamp::now(),
        })
    }

    /// Appends `pause_requested` for `stage`.
    pub fn pause_requested(&self, stage: StageId) -> Self {
        self.push(PipelineEvent::PauseRequested {
            stage,
            at: Timestamp::now(),
        })
    }

    /// Appends `resumed`, answering the pending pause.
    ///
    /// Fails if the state is not paused.
    pub fn resumed(&self, response: impl Into<String>) -> Result<Self, PipelineError> {
        let stage = self
            .paused_stage()
            .ok_or_else(|| PipelineError::transition(format!("session {} is not paused", self.session_id)))?;
        Ok(self.push(PipelineEvent::Resumed {
            stage,
            response: response.into(),
            at: Timestamp::now(),
        }))
    }

    /// Appends `pause_formatted`.
    pub fn pause_formatted(&self, stage: StageId, path: NormalizationPath) -> Self {
        self.push(PipelineEvent::PauseFormatted {
            stage,
            path,
            at: Timestamp::now(),
        })
    }

    /// Appends `repair_iteration`.
    pub fn repair_iteration(&self, unit: RepairUnitName, iteration: u32, feedback: Option<String>) -> Self {
        self.push(PipelineEvent::RepairIteration {
            unit,
            iteration,
            feedback,
            at: Timestamp::now(),
        })
    }

    /// Puts back the outputs a repair unit produced in round `iteration` and
    /// appends `repair_round_restored`.
    ///
    /// Only stored outputs change. Usage and cost of every round stay on the
    /// log, and the resume point is unaffected.
    pub fn restore_repair_round(
        &self,
        unit: RepairUnitName,
        iteration: u32,
        outputs: BTreeMap<StageId, StageResult>,
    ) -> Self {
        let mut next = self.push(PipelineEvent::RepairRoundRestored {
            unit,
            iteration,
            stages: outputs.keys().copied().collect(),
            at: Timestamp::now(),
        });
        next.outputs.extend(outputs);
        next
    }

    /// Flags the output of `stage` as carrying open issues and appends
    /// `repair_exhausted`.
    pub fn repair_exhausted(&self, unit: RepairUnitName, stage: StageId, iterations: u32) -> Self {
        let mut next = self.push(PipelineEvent::RepairExhausted {
            unit: unit.clone(),
            stage,
            iterations,
            at: Timestamp::now(),
        });
        if let Some(output) = next.outputs.get_mut(&stage) {
            output.disposition = Disposition::OpenIssues { unit, iterations };
        }
        next
    }

    /// Appends `halted`.
    pub fn halted(&self, reason: impl Into<String>) -> Self {
        self.push(PipelineEvent::Halted {
            reason: reason.into(),
            at: Timestamp::now(),
        })
    }

    /// Applies host-issued commands in order, never crossing a pause point
    /// raised within the same batch.
    ///
    /// A `CompleteStage` for a pause-after stage appends `pause_requested`;
    /// every command after it is deferred, including a `Resume`, because a
    /// pause raised in this call can only be answered by a later call. A
    /// `StartStage` while paused is likewise deferred.
    pub fn apply_batch(
        &self,
        commands: Vec<StateCommand>,
        definition: &PipelineDefinition,
    ) -> Result<BatchOutcome, PipelineError> {
        let mut state = self.clone();
        let mut applied = 0;
        let mut iter = commands.into_iter();

        while let Some(command) = iter.next() {
            match command {
                StateCommand::CompleteStage { stage, result } => {
                    let def = definition.stage(stage).ok_or(PipelineError::UnknownStage { stage })?;
                    if state.is_paused() {
                        let mut deferred = vec![StateCommand::CompleteStage { stage, result }];
                        deferred.extend(iter);
                        return Ok(BatchOutcome { state, applied, deferred });
                    }
                    state = state.stage_completed(stage, 0, result, TokenCost::zero());
                    applied += 1;
                    if def.pause_after {
                        state = state.pause_requested(stage);
                        return Ok(BatchOutcome {
                            state,
                            applied,
                            deferred: iter.collect(),
                        });
                    }
                }
                StateCommand::Resume { response } => {
                    state = state.resumed(response)?;
                    applied += 1;
                }
                StateCommand::StartStage { stage } => {
                    if definition.stage(stage).is_none() {
                        return Err(PipelineError::UnknownStage { stage });
                    }
                    if state.is_paused() {
                        let mut deferred = vec![StateCommand::StartStage { stage }];
                        deferred.extend(iter);
                        return Ok(BatchOutcome { state, applied, deferred });
                    }
                    state = state.stage_started(stage, 0);
                    applied += 1;
                }
            }
        }

        Ok(BatchOutcome {
            state,
            applied,
            deferred: Vec::new(),
        })
    }

    // -- accessors ----------------------------------------------------------

    /// Run identifier.
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Owning agent, if recorded.
    pub fn agent_slug(&self) -> Option<&AgentSlug> {
        self.agent_slug.as_ref()
    }

    /// The completed run this one continues, if any.
    pub fn previous_session_id(&self) -> Option<SessionId> {
        self.previous_session_id
    }

    /// The question the run answers.
    pub fn question(&self) -> &str {
        &self.question
    }

    /// Stage ordinals planned at creation.
    pub fn plan(&self) -> &[StageId] {
        &self.plan
    }

    /// Creation time.
    pub fn created_at(&self) -> Timestamp {
        self.created_at
    }

    /// The event log, oldest first.
    pub fn events(&self) -> &[PipelineEvent] {
        &self.events
    }

    /// Stored output of `stage`.
    pub fn output(&self, stage: StageId) -> Option<&StageResult> {
        self.outputs.get(&stage)
    }

    /// All stored outputs.
    pub fn outputs(&self) -> &BTreeMap<StageId, StageResult> {
        &self.outputs
    }

    // -- derived flags ------------------------------------------------------

    /// The stage the most recent unanswered pause was raised after.
    pub fn paused_stage(&self) -> Option<StageId> {
        let (index, stage) = self.events.iter().enumerate().rev().find_map(|(i, e)| match e {
            PipelineEvent::PauseRequested { stage, .. } => Some((i, *stage)),
            _ => None,
        })?;
        let answered = self.events[index + 1..]
            .iter()
            .any(|e| matches!(e, PipelineEvent::Resumed { stage: s, .. } if *s == stage));
        if answered {
            None
        } else {
            Some(stage)
        }
    }

    /// `true` iff the most recent pause has no later matching `resumed` event.
    pub fn is_paused(&self) -> bool {
        self.paused_stage().is_some()
    }

    /// `true` once a `halted` event has been appended.
    pub fn is_halted(&self) -> bool {
        self.events.iter().any(|e| matches!(e, PipelineEvent::Halted { .. }))
    }

    /// The stage execution resumes from.
    ///
    /// A started-but-unfinished (or failed) stage is re-run; otherwise the
    /// stage after the most recently completed one. `None` when the plan is
    /// exhausted.
    pub fn current_stage(&self) -> Option<StageId> {
        let last = self.events.iter().rev().find_map(|e| match e {
            PipelineEvent::StageStarted { stage, .. } | PipelineEvent::StageFailed { stage, .. } => {
                Some((*stage, false))
            }
            PipelineEvent::StageCompleted { stage, .. } => Some((*stage, true)),
            _ => None,
        });
        match last {
            None => self.plan.first().copied(),
            Some((stage, false)) => Some(stage),
            Some((stage, true)) => self.plan.iter().copied().find(|s| *s > stage),
        }
    }

    /// `true` when every planned stage has an output, nothing is pending, and
    /// the run is neither paused nor halted.
    pub fn is_complete(&self) -> bool {
        !self.is_paused()
            && !self.is_halted()
            && self.current_stage().is_none()
            && self.plan.iter().all(|s| self.outputs.contains_key(s))
    }

    /// Sum of the cost of every completion, repair rounds included.
    pub fn total_cost(&self) -> TokenCost {
        self.events
            .iter()
            .filter_map(|e| match e {
                PipelineEvent::StageCompleted { cost, .. } => Some(*cost),
                _ => None,
            })
            .sum()
    }

    /// Sum of the usage of every completion, repair rounds included.
    pub fn total_usage(&self) -> Usage {
        self.events
            .iter()
            .filter_map(|e| match e {
                PipelineEvent::StageCompleted { usage, .. } => Some(*usage),
                _ => None,
            })
            .fold(Usage::none(), |acc, u| acc + u)
    }

    /// Repair rounds already started for `unit`.
    pub fn repair_iterations(&self, unit: &RepairUnitName) -> u32 {
        self.events
            .iter()
            .filter(|e| matches!(e, PipelineEvent::RepairIteration { unit: u, .. } if u == unit))
            .count() as u32
    }

    /// `true` if `unit` has already been flagged as exhausted.
    pub fn repair_was_exhausted(&self, unit: &RepairUnitName) -> bool {
        self.events
            .iter()
            .any(|e| matches!(e, PipelineEvent::RepairExhausted { unit: u, .. } if u == unit))
    }

    /// The user's most recent pause response, if any.
    pub fn latest_guidance(&self) -> Option<&str> {
        self.events.iter().rev().find_map(|e| match e {
            PipelineEvent::Resumed { response, .. } => Some(response.as_str()),
            _ => None,
        })
    }

    // -- persistence --------------------------------------------------------

    /// Converts to the serialisable snapshot form.
    pub fn to_snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            format: SNAPSHOT_FORMAT.to_string(),
            version: SNAPSHOT_VERSION,
            session_id: self.session_id,
            agent_slug: self.agent_slug.clone(),
            previous_session_id: self.previous_session_id,
            question: self.question.clone(),
            plan: self.plan.clone(),
            created_at: self.created_at,
            events: self.events.clone(),
            outputs: self
                .outputs
                .iter()
                .map(|(stage, result)| StoredOutput {
                    stage: *stage,
                    result: result.clone(),
                })
                .collect(),
        }
    }

    /// Rebuilds a state from a snapshot, checking its format tag and version.
    pub fn from_snapshot(snapshot: StateSnapshot) -> Result<Self, SnapshotError> {
        if snapshot.format != SNAPSHOT_FORMAT {
            return Err(SnapshotError::UnknownFormat(snapshot.format));
        }
        if snapshot.version > SNAPSHOT_VERSION {
            return Err(SnapshotError::UnsupportedVersion(snapshot.version));
        }
        Ok(Self {
            session_id: snapshot.session_id,
            agent_slug: snapshot.agent_slug,
            previous_session_id: snapshot.previous_session_id,
            question: snapshot.question,
            plan: snapshot.plan,
            created_at: snapshot.created_at,
            events: snapshot.events,
            outputs: snapshot.outputs.into_iter().map(|o| (o.stage, o.result)).collect(),
        })
    }

    /// Serialises the snapshot as pretty-printed JSON.
    pub fn to_json(&self) -> Result<String, SnapshotError> {
        serde_json::to_string_pretty(&self.to_snapshot()).map_err(|e| SnapshotError::Malformed(e.to_string()))
    }

    /// Parses a snapshot written by [`PipelineState::to_json`].
    pub fn from_json(json: &str) -> Result<Self, SnapshotError> {
        let snapshot: StateSnapshot =
            serde_json::from_str(json).map_err(|e| SnapshotError::Malformed(e.to_string()))?;
        Self::from_snapshot(snapshot)
    }
}

/// Self-describing persisted form of a [`PipelineState`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// Always [`SNAPSHOT_FORMAT`].
    pub format: String,
    /// Schema version.
    pub version: u32,
    /// Run identifier.
    pub session_id: SessionId,
    /// Owning agent.
    #[serde(default)]
    pub agent_slug: Option<AgentSlug>,
    /// Completed run this one continues.
    #[serde(default)]
    pub previous_session_id: Option<SessionId>,
    /// The question being answered.
    pub question: String,
    /// Planned stage ordinals.
    pub plan: Vec<StageId>,
    /// Creation time.
    pub created_at: Timestamp,
    /// Ordered event log.
    pub events: Vec<PipelineEvent>,
    /// Stage outputs in ordinal order.
    pub outputs: Vec<StoredOutput>,
}

/// One entry of the snapshot's output list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredOutput {
    /// Producing stage.
    pub stage: StageId,
    /// Its latest result.
    pub result: StageResult,
}

/// Failure to read or write a snapshot.
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum SnapshotError {
    /// The document is not valid snapshot JSON.
    #[error("malformed state snapshot: {0}")]
    Malformed(String),
    /// The format tag is not ours.
    #[error("unrecognised snapshot format '{0}'")]
    UnknownFormat(String),
    /// Written by a newer version.
    #[error("unsupported snapshot version {0}")]
    UnsupportedVersion(u32),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::StageResult;
    use assert_matches::assert_matches;
    use proptest::prelude::*;
    use serde_json::json;

    fn def() -> PipelineDefinition {
        PipelineDefinition::research()
    }

    fn result(summary: &str) -> StageResult {
        StageResult::executed("text", json!({ "summary": summary }), Usage::new(100, 20), summary)
    }

    fn fresh() -> PipelineState {
        PipelineState::new(SessionId::new_random(), "What does ISA 315 require?", &def())
    }

    #[test]
    fn new_state_starts_at_first_stage() {
        let state = fresh();
        assert_eq!(state.current_stage(), Some(StageId::new(0)));
        assert!(!state.is_paused());
        assert!(!state.is_complete());
        assert!(state.total_cost().is_zero());
    }

    #[test]
    fn completion_advances_current_stage_and_started_stage_is_rerun() {
        let s0 = StageId::new(0);
        let state = fresh().stage_started(s0, 0);
        assert_eq!(state.current_stage(), Some(s0));
        let state = state.stage_completed(s0, 0, result("a"), TokenCost::zero());
        assert_eq!(state.current_stage(), Some(StageId::new(1)));
        let state = state.stage_started(StageId::new(1), 0).stage_failed(StageId::new(1), 0, "boom");
        assert_eq!(state.current_stage(), Some(StageId::new(1)));
    }

    #[test]
    fn paused_flips_false_only_after_resumed_event() {
        let s0 = StageId::new(0);
        let state = fresh()
            .stage_started(s0, 0)
            .stage_completed(s0, 0, result("a"), TokenCost::zero())
            .pause_requested(s0)
            .pause_formatted(s0, NormalizationPath::AnalysisSubQueries);
        assert!(state.is_paused());
        assert_eq!(state.paused_stage(), Some(s0));

        let resumed = state.resumed("proceed").expect("paused");
        assert!(!resumed.is_paused());
        assert_eq!(resumed.current_stage(), Some(StageId::new(1)));
        assert_eq!(resumed.latest_guidance(), Some("proceed"));
        assert!(state.is_paused(), "original instance untouched");
    }

    #[test]
    fn resuming_unpaused_state_is_rejected() {
        assert_matches!(fresh().resumed("go"), Err(PipelineError::InvalidTransition { .. }));
    }

    #[test]
    fn complete_once_every_planned_stage_has_output() {
        let mut state = fresh();
        for id in def().stage_ids() {
            state = state.stage_started(id, 0).stage_completed(id, 0, result("x"), TokenCost::zero());
        }
        assert!(state.is_complete());
        assert_eq!(state.current_stage(), None);
        assert!(!state.halted("late").is_complete());
    }

    #[test]
    fn repair_exhausted_flags_output() {
        let unit = RepairUnitName::new("synthesis").unwrap();
        let s4 = StageId::new(4);
        let state = fresh()
            .stage_completed(s4, 0, result("v"), TokenCost::zero())
            .repair_iteration(unit.clone(), 1, Some("fix".into()))
            .repair_exhausted(unit.clone(), s4, 1);
        assert_eq!(state.repair_iterations(&unit), 1);
        assert!(state.repair_was_exhausted(&unit));
        assert_matches!(
            state.output(s4).map(|o| &o.disposition),
            Some(Disposition::OpenIssues { iterations: 1, .. })
        );
    }

    #[test]
    fn restoring_a_repair_round_swaps_outputs_but_keeps_costs() {
        let unit = RepairUnitName::new("synthesis").unwrap();
        let (s3, s4) = (StageId::new(3), StageId::new(4));
        let cost = TokenCost::new(0.5).unwrap();
        let first = fresh()
            .stage_completed(s3, 0, result("draft 1"), cost)
            .stage_completed(s4, 0, result("0.8"), cost);
        let kept: BTreeMap<_, _> = [s3, s4]
            .into_iter()
            .map(|s| (s, first.output(s).cloned().unwrap()))
            .collect();
        let later = first
            .repair_iteration(unit.clone(), 1, None)
            .stage_completed(s3, 1, result("draft 2"), cost)
            .stage_completed(s4, 1, result("0.2"), cost);

        let restored = later.restore_repair_round(unit.clone(), 0, kept);

        assert_eq!(restored.output(s3).unwrap().summary, "draft 1");
        assert_eq!(restored.output(s4).unwrap().summary, "0.8");
        assert_eq!(later.output(s3).unwrap().summary, "draft 2", "original instance untouched");
        assert_eq!(restored.total_cost(), later.total_cost());
        assert_eq!(restored.current_stage(), later.current_stage());
        assert_eq!(PipelineState::from_json(&restored.to_json().unwrap()).unwrap(), restored);
    }

    #[test]
    fn batch_never_crosses_a_pause_point_raised_in_the_same_call() {
        let s0 = StageId::new(0);
        let s1 = StageId::new(1);
        let outcome = fresh()
            .stage_started(s0, 0)
            .apply_batch(
                vec![
                    StateCommand::CompleteStage { stage: s0, result: result("a") },
                    StateCommand::Resume { response: "proceed".into() },
                    StateCommand::StartStage { stage: s1 },
                ],
                &def(),
            )
            .expect("batch");
        assert_eq!(outcome.applied, 1);
        assert_eq!(outcome.deferred.len(), 2);
        assert!(outcome.state.is_paused());
        assert!(!outcome
            .state
            .events()
            .iter()
            .any(|e| matches!(e, PipelineEvent::StageStarted { stage, .. } if *stage == s1)));

        // A later call may answer the pause and proceed.
        let next = outcome.state.apply_batch(outcome.deferred, &def()).expect("batch");
        assert_eq!(next.applied, 2);
        assert!(next.deferred.is_empty());
        assert_eq!(next.state.current_stage(), Some(s1));
    }

    #[test]
    fn snapshot_round_trip_is_lossless() {
        let s0 = StageId::new(0);
        let state = fresh()
            .with_agent(AgentSlug::new("deep-research").unwrap())
            .with_previous_session(SessionId::new_random())
            .stage_started(s0, 0)
            .stage_completed(s0, 0, result("a"), TokenCost::new(0.25).unwrap())
            .pause_requested(s0)
            .pause_formatted(s0, NormalizationPath::Unrecognized);
        let json = state.to_json().expect("serialise");
        assert!(json.contains(SNAPSHOT_FORMAT));
        let back = PipelineState::from_json(&json).expect("parse");
        assert_eq!(back, state);
    }

    #[test]
    fn rejects_foreign_snapshot() {
        let mut snapshot = fresh().to_snapshot();
        snapshot.format = "other".into();
        assert_matches!(PipelineState::from_snapshot(snapshot), Err(SnapshotError::UnknownFormat(_)));
        assert_matches!(PipelineState::from_json("{"), Err(SnapshotError::Malformed(_)));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Start(u32),
        Complete(u32, u64),
        Fail(u32),
        Pause(u32),
        Resume,
        Halt,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u32..6).prop_map(Op::Start),
            ((0u32..6), (0u64..5_000)).prop_map(|(s, t)| Op::Complete(s, t)),
            (0u32..6).prop_map(Op::Fail),
            (0u32..6).prop_map(Op::Pause),
            Just(Op::Resume),
            Just(Op::Halt),
        ]
    }

    fn apply(state: &PipelineState, op: &Op) -> PipelineState {
        match op {
            Op::Start(s) => state.stage_started(StageId::new(*s), 0),
            Op::Complete(s, t) => state.stage_completed(
                StageId::new(*s),
                0,
                StageResult::executed("", json!({}), Usage::new(*t, 1), ""),
                TokenCost::new(*t as f64 / 1_000.0).unwrap(),
            ),
            Op::Fail(s) => state.stage_failed(StageId::new(*s), 0, "err"),
            Op::Pause(s) => state.pause_requested(StageId::new(*s)),
            Op::Resume => state.resumed("ok").unwrap_or_else(|_| state.clone()),
            Op::Halt => state.halted("stop"),
        }
    }

    proptest! {
        #[test]
        fn mutations_never_alter_the_receiver(ops in proptest::collection::vec(op(), 0..24)) {
            let mut state = fresh();
            for op in &ops {
                let before = state.clone();
                let next = apply(&state, op);
                prop_assert_eq!(&state, &before);
                state = next;
            }
        }

        #[test]
        fn any_reachable_state_round_trips(ops in proptest::collection::vec(op(), 0..24)) {
            let mut state = fresh();
            for op in &ops {
                state = apply(&state, op);
            }
            let back = PipelineState::from_json(&state.to_json().unwrap()).unwrap();
            prop_assert_eq!(back, state);
        }
    }
}
