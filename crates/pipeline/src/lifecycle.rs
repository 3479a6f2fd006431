//! Lifecycle events emitted to the host.
//!
//! Every orchestrator invocation emits a sequence of [`LifecycleEvent`]s that
//! ends in exactly one terminal event (see [`LifecycleEvent::is_terminal`]).
//! The orchestrator makes no assumption about how events are displayed.

use serde::{Deserialize, Serialize};

use crate::pause::PauseMessage;
use crate::{CostBudget, RepairUnitName, SessionId, StageId, TokenCost};

/// One host-facing event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleEvent {
    StageStarted {
        session: SessionId,
        stage: StageId,
        name: String,
        iteration: u32,
    },
    StageCompleted {
        session: SessionId,
        stage: StageId,
        name: String,
        summary: String,
        cost: TokenCost,
    },
    StageSkipped {
        session: SessionId,
        stage: StageId,
        name: String,
        reason: String,
    },
    RepairIteration {
        session: SessionId,
        unit: RepairUnitName,
        iteration: u32,
    },
    RepairExhausted {
        session: SessionId,
        unit: RepairUnitName,
        iterations: u32,
    },
    /// Terminal: the run suspended for human input.
    Paused {
        session: SessionId,
        stage: StageId,
        message: PauseMessage,
    },
    /// Terminal: every stage completed.
    Completed {
        session: SessionId,
        document: String,
        total_cost: TokenCost,
    },
    /// Terminal: the cost budget was reached at a stage boundary.
    BudgetExceeded {
        session: SessionId,
        accumulated: TokenCost,
        limit: CostBudget,
    },
    /// Terminal: the tool connection could not be opened; no stage ran.
    ConnectionFailed { reason: String },
    /// Terminal: any other failure. `diagnostic` is a short, user-safe string.
    Error {
        session: Option<SessionId>,
        reason: String,
        diagnostic: String,
    },
}

impl LifecycleEvent {
    /// `true` for events that end an invocation.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Paused { .. }
                | Self::Completed { .. }
                | Self::BudgetExceeded { .. }
                | Self::ConnectionFailed { .. }
                | Self::Error { .. }
        )
    }
}

/// Receives lifecycle events. Implementations must not block.
pub trait LifecycleObserver: Send + Sync {
    fn on_event(&self, event: &LifecycleEvent);
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl LifecycleObserver for NoopObserver {
    fn on_event(&self, _event: &LifecycleEvent) {}
}
