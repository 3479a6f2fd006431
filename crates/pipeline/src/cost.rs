//! Per-stage cost accounting and budget enforcement.
//!
//! [`CostTracker::record_stage`] always accumulates: a repair round that re-runs
//! a stage adds its usage to the stage's existing [`CostRecord`] rather than
//! replacing it. The budget is consulted by the orchestrator once per stage
//! boundary through [`CostTracker::within_budget`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::state::{PipelineEvent, PipelineState};
use crate::{CostBudget, PipelineError, StageId, TokenCost, Usage};

/// Per-million-token prices for one model, in USD.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    /// Price per million input tokens.
    pub input_per_million: f64,
    /// Price per million output tokens.
    pub output_per_million: f64,
}

impl ModelPricing {
    /// Creates a price sheet.
    pub fn new(input_per_million: f64, output_per_million: f64) -> Self {
        Self {
            input_per_million,
            output_per_million,
        }
    }

    /// Pricing that makes every call free; used for tool-only configurations.
    pub fn free() -> Self {
        Self::new(0.0, 0.0)
    }

    /// Dollar cost of `usage` at these prices.
    pub fn cost_of(&self, usage: Usage) -> TokenCost {
        let input = usage.input_tokens.as_u64() as f64 * self.input_per_million / 1_000_000.0;
        let output = usage.output_tokens.as_u64() as f64 * self.output_per_million / 1_000_000.0;
        TokenCost::new(input + output).unwrap_or_else(TokenCost::zero)
    }
}

/// Accumulated usage and cost of one stage across all of its executions.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CostRecord {
    /// The stage.
    pub stage: StageId,
    /// Summed usage.
    pub usage: Usage,
    /// Summed cost.
    pub cost: TokenCost,
    /// Number of recordings (1 + repair rounds).
    pub recordings: u32,
}

/// Running cost of one run.
#[derive(Debug, Clone)]
pub struct CostTracker {
    pricing: ModelPricing,
    budget: Option<CostBudget>,
    records: BTreeMap<StageId, CostRecord>,
}

impl CostTracker {
    /// Creates an empty tracker. `budget` of `None` means unlimited.
    pub fn new(pricing: ModelPricing, budget: Option<CostBudget>) -> Self {
        Self {
            pricing,
            budget,
            records: BTreeMap::new(),
        }
    }

    /// Rebuilds a tracker from the completions recorded in `state`.
    ///
    /// Used on resume so the budget keeps counting across pauses.
    pub fn from_state(state: &PipelineState, pricing: ModelPricing, budget: Option<CostBudget>) -> Self {
        let mut tracker = Self::new(pricing, budget);
        for event in state.events() {
            if let PipelineEvent::StageCompleted { stage, usage, cost, .. } = event {
                tracker.add(*stage, *usage, *cost);
            }
        }
        tracker
    }

    fn add(&mut self, stage: StageId, usage: Usage, cost: TokenCost) {
        let record = self.records.entry(stage).or_insert(CostRecord {
            stage,
            usage: Usage::none(),
            cost: TokenCost::zero(),
            recordings: 0,
        });
        record.usage += usage;
        record.cost += cost;
        record.recordings += 1;
    }

    /// Adds `usage` to the running total for `stage` and returns the cost of
    /// this recording alone.
    pub fn record_stage(&mut self, stage: StageId, usage: Usage) -> TokenCost {
        let cost = self.pricing.cost_of(usage);
        self.add(stage, usage, cost);
        tracing::debug!(
            stage = %stage,
            input_tokens = %usage.input_tokens,
            output_tokens = %usage.output_tokens,
            cost = %cost,
            total = %self.total(),
            "stage usage recorded"
        );
        cost
    }

    /// Accumulated record for `stage`.
    pub fn record(&self, stage: StageId) -> Option<&CostRecord> {
        self.records.get(&stage)
    }

    /// Every stage's record in ordinal order.
    pub fn records(&self) -> impl Iterator<Item = &CostRecord> {
        self.records.values()
    }

    /// Total cost across every stage.
    pub fn total(&self) -> TokenCost {
        self.records.values().map(|r| r.cost).sum()
    }

    /// Total usage across every stage.
    pub fn total_usage(&self) -> Usage {
        self.records.values().fold(Usage::none(), |acc, r| acc + r.usage)
    }

    /// Configured budget.
    pub fn budget(&self) -> Option<CostBudget> {
        self.budget
    }

    /// `false` once the total has reached the budget.
    pub fn within_budget(&self) -> bool {
        self.budget.map_or(true, |b| !b.is_exceeded_by(self.total()))
    }

    /// Like [`CostTracker::within_budget`] but returns the typed error.
    pub fn check_budget(&self) -> Result<(), PipelineError> {
        match self.budget {
            Some(limit) if limit.is_exceeded_by(self.total()) => Err(PipelineError::BudgetExceeded {
                accumulated: self.total(),
                limit,
            }),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::{PipelineDefinition, StageResult};
    use crate::SessionId;
    use assert_matches::assert_matches;
    use proptest::prelude::*;
    use serde_json::json;

    fn pricing() -> ModelPricing {
        ModelPricing::new(3.0, 15.0)
    }

    #[test]
    fn prices_input_and_output_separately() {
        let cost = pricing().cost_of(Usage::new(1_000_000, 100_000));
        assert!((cost.as_f64() - 4.5).abs() < 1e-9);
    }

    #[test]
    fn repeated_recordings_for_one_stage_add_up() {
        let mut tracker = CostTracker::new(pricing(), None);
        let s = StageId::new(3);
        tracker.record_stage(s, Usage::new(1_000, 100));
        tracker.record_stage(s, Usage::new(2_000, 300));
        let record = tracker.record(s).expect("record");
        assert_eq!(record.usage, Usage::new(3_000, 400));
        assert_eq!(record.recordings, 2);
    }

    #[test]
    fn budget_is_exceeded_at_the_limit() {
        let mut tracker = CostTracker::new(pricing(), CostBudget::new(0.003));
        assert!(tracker.within_budget());
        tracker.record_stage(StageId::new(0), Usage::new(1_000, 0));
        assert!(!tracker.within_budget());
        assert_matches!(tracker.check_budget(), Err(PipelineError::BudgetExceeded { .. }));
    }

    #[test]
    fn rebuilds_from_state_events() {
        let def = PipelineDefinition::research();
        let s = StageId::new(3);
        let mut live = CostTracker::new(pricing(), None);
        let mut state = PipelineState::new(SessionId::new_random(), "q", &def);
        for usage in [Usage::new(500, 50), Usage::new(700, 70)] {
            let cost = live.record_stage(s, usage);
            state = state.stage_completed(s, 0, StageResult::executed("", json!({}), usage, ""), cost);
        }
        let rebuilt = CostTracker::from_state(&state, pricing(), None);
        assert_eq!(rebuilt.record(s), live.record(s));
        assert_eq!(rebuilt.total(), state.total_cost());
    }

    proptest! {
        #[test]
        fn total_is_the_sum_of_all_recordings(outputs in proptest::collection::vec(0u64..100_000, 1..12)) {
            let mut tracker = CostTracker::new(ModelPricing::new(0.0, 1_000_000.0), None);
            let s = StageId::new(1);
            for out in &outputs {
                tracker.record_stage(s, Usage::new(0, *out));
            }
            let expected: u64 = outputs.iter().sum();
            let record = tracker.record(s).unwrap();
            prop_assert_eq!(record.usage.output_tokens.as_u64(), expected);
            prop_assert!((record.cost.as_f64() - expected as f64).abs() < 1e-6);
        }
    }
}
