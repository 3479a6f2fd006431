//! Stage definitions, repair units, and the result type every stage produces.
//!
//! A [`PipelineDefinition`] is data: it is deserialised from configuration (or
//! built with [`PipelineDefinition::research`]) and validated once on
//! construction, so the orchestrator never has to re-check ordering or
//! repair-unit membership while running.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::{PipelineError, RepairUnitName, StageId, TokenCount, Usage};

// ---------------------------------------------------------------------------
// Definitions
// ---------------------------------------------------------------------------

/// Which handler category executes a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    /// Builds a prompt, calls the model, extracts structured output.
    Model,
    /// Calls one or more external tools; no model call.
    Tool,
    /// Deterministic transform of prior outputs; no external calls.
    Pure,
}

/// The logical output shape a stage produces.
///
/// Selects the normaliser used by [`crate::shapes::normalize`] when a stage's
/// data is rendered for a human or consumed downstream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    /// Question decomposition into sub-queries.
    Analysis,
    /// Web calibration results.
    Calibration,
    /// Retrieved knowledge-base evidence.
    Evidence,
    /// Synthesised, cited answer.
    Answer,
    /// Citation verification outcome.
    Verification,
    /// Final rendered document.
    Document,
    /// Anything else; only a `summary` field is understood.
    #[default]
    Generic,
}

/// One ordered unit of pipeline work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDefinition {
    /// Ordinal; stages run in ascending order.
    pub id: StageId,
    /// Short machine name, e.g. `"retrieve"`. Also accepted in `skip <name>`.
    pub name: String,
    /// Handler category.
    pub kind: StageKind,
    /// Output shape used for normalisation.
    #[serde(default)]
    pub output: OutputKind,
    /// Suspend for human input once this stage completes.
    #[serde(default)]
    pub pause_after: bool,
    /// Repair unit this stage belongs to, if any.
    #[serde(default)]
    pub repair_unit: Option<RepairUnitName>,
    /// Requested output-token budget for model-driven stages.
    #[serde(default)]
    pub output_budget: Option<TokenCount>,
    /// Extra names a user may use to refer to this stage.
    #[serde(default)]
    pub aliases: Vec<String>,
}

impl StageDefinition {
    /// Creates a stage with defaults for every optional field.
    pub fn new(id: u32, name: impl Into<String>, kind: StageKind, output: OutputKind) -> Self {
        Self {
            id: StageId::new(id),
            name: name.into(),
            kind,
            output,
            pause_after: false,
            repair_unit: None,
            output_budget: None,
            aliases: Vec::new(),
        }
    }

    /// Marks the stage as a pause point.
    pub fn pause_after(mut self) -> Self {
        self.pause_after = true;
        self
    }

    /// Sets the requested output-token budget.
    pub fn with_output_budget(mut self, tokens: u64) -> Self {
        self.output_budget = Some(TokenCount::new(tokens));
        self
    }

    /// Adds an alias accepted by intent parsing.
    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.aliases.push(alias.into());
        self
    }

    /// Returns `true` if `name` refers to this stage (case-insensitive).
    pub fn answers_to(&self, name: &str) -> bool {
        let name = name.trim();
        self.name.eq_ignore_ascii_case(name) || self.aliases.iter().any(|a| a.eq_ignore_ascii_case(name))
    }
}

/// A contiguous range of stages re-run as a group while its last stage
/// reports that repair is needed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepairUnit {
    /// Unit name; recorded in repair-iteration events.
    pub name: RepairUnitName,
    /// Member stages in execution order.
    pub stages: Vec<StageId>,
    /// Maximum number of additional rounds after the first pass.
    pub max_iterations: u32,
    /// Field of the last stage's data carrying feedback for the next round.
    pub feedback_field: String,
}

impl RepairUnit {
    /// The stage whose outcome decides whether another round is needed.
    pub fn last_stage(&self) -> Option<StageId> {
        self.stages.last().copied()
    }
}

/// Serialised form of a definition; converted through validation.
#[derive(Debug, Clone, Deserialize)]
struct RawDefinition {
    name: String,
    stages: Vec<StageDefinition>,
    #[serde(default)]
    repair_units: Vec<RepairUnit>,
}

/// A validated, ordered set of stages plus their repair units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawDefinition")]
pub struct PipelineDefinition {
    name: String,
    stages: Vec<StageDefinition>,
    repair_units: Vec<RepairUnit>,
}

impl TryFrom<RawDefinition> for PipelineDefinition {
    type Error = PipelineError;

    fn try_from(raw: RawDefinition) -> Result<Self, Self::Error> {
        Self::new(raw.name, raw.stages, raw.repair_units)
    }
}

impl PipelineDefinition {
    /// Validates and builds a definition.
    ///
    /// Rules: at least one stage; ordinals strictly ascending; names unique;
    /// every repair unit is non-empty, contiguous, references existing stages
    /// whose `repair_unit` field names it, has a non-empty feedback field; no
    /// repair-unit member is a pause point.
    pub fn new(
        name: impl Into<String>,
        stages: Vec<StageDefinition>,
        repair_units: Vec<RepairUnit>,
    ) -> Result<Self, PipelineError> {
        if stages.is_empty() {
            return Err(PipelineError::config("pipeline has no stages"));
        }
        for pair in stages.windows(2) {
            if pair[0].id >= pair[1].id {
                return Err(PipelineError::config(format!(
                    "stage ordinals must be strictly ascending ({} then {})",
                    pair[0].id, pair[1].id
                )));
            }
        }
        let mut names = BTreeSet::new();
        for stage in &stages {
            if !names.insert(stage.name.to_ascii_lowercase()) {
                return Err(PipelineError::config(format!("duplicate stage name '{}'", stage.name)));
            }
        }

        for unit in &repair_units {
            if unit.stages.is_empty() {
                return Err(PipelineError::config(format!("repair unit '{}' is empty", unit.name)));
            }
            if unit.feedback_field.trim().is_empty() {
                return Err(PipelineError::config(format!(
                    "repair unit '{}' has no feedback field",
                    unit.name
                )));
            }
            let positions: Vec<usize> = unit
                .stages
                .iter()
                .map(|id| {
                    stages.iter().position(|s| s.id == *id).ok_or_else(|| {
                        PipelineError::config(format!(
                            "repair unit '{}' references unknown stage {id}",
                            unit.name
                        ))
                    })
                })
                .collect::<Result<_, _>>()?;
            if positions.windows(2).any(|w| w[1] != w[0] + 1) {
                return Err(PipelineError::config(format!(
                    "repair unit '{}' must cover a contiguous stage range",
                    unit.name
                )));
            }
            for &pos in &positions {
                let stage = &stages[pos];
                if stage.repair_unit.as_ref() != Some(&unit.name) {
                    return Err(PipelineError::config(format!(
                        "stage '{}' is listed in repair unit '{}' but does not declare it",
                        stage.name, unit.name
                    )));
                }
                if stage.pause_after {
                    return Err(PipelineError::config(format!(
                        "stage '{}' is inside repair unit '{}' and cannot be a pause point",
                        stage.name, unit.name
                    )));
                }
            }
        }
        for stage in &stages {
            if let Some(unit) = &stage.repair_unit {
                if !repair_units.iter().any(|u| &u.name == unit && u.stages.contains(&stage.id)) {
                    return Err(PipelineError::config(format!(
                        "stage '{}' declares unknown repair unit '{unit}'",
                        stage.name
                    )));
                }
            }
        }

        Ok(Self {
            name: name.into(),
            stages,
            repair_units,
        })
    }

    /// The default six-stage research pipeline.
    ///
    /// analyze (pause) → calibrate (pause) → retrieve → synthesize → verify → render,
    /// with `synthesize`/`verify` forming the `synthesis` repair unit.
    pub fn research() -> Self {
        let unit = RepairUnitName::new("synthesis").unwrap_or_else(|| unreachable!());
        let stages = vec![
            StageDefinition::new(0, "analyze", StageKind::Model, OutputKind::Analysis)
                .pause_after()
                .with_output_budget(2_048)
                .with_alias("analysis"),
            StageDefinition::new(1, "calibrate", StageKind::Tool, OutputKind::Calibration)
                .pause_after()
                .with_alias("calibration")
                .with_alias("web search"),
            StageDefinition::new(2, "retrieve", StageKind::Tool, OutputKind::Evidence)
                .with_alias("retrieval")
                .with_alias("search"),
            StageDefinition {
                repair_unit: Some(unit.clone()),
                ..StageDefinition::new(3, "synthesize", StageKind::Model, OutputKind::Answer)
                    .with_output_budget(8_192)
                    .with_alias("synthesis")
            },
            StageDefinition {
                repair_unit: Some(unit.clone()),
                ..StageDefinition::new(4, "verify", StageKind::Tool, OutputKind::Verification)
                    .with_alias("verification")
            },
            StageDefinition::new(5, "render", StageKind::Pure, OutputKind::Document),
        ];
        let repair_units = vec![RepairUnit {
            name: unit,
            stages: vec![StageId::new(3), StageId::new(4)],
            max_iterations: 2,
            feedback_field: "repair_instructions".to_string(),
        }];
        match Self::new("research", stages, repair_units) {
            Ok(def) => def,
            Err(e) => unreachable!("built-in research definition is invalid: {e}"),
        }
    }

    /// Definition name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// All stages in execution order.
    pub fn stages(&self) -> &[StageDefinition] {
        &self.stages
    }

    /// All repair units.
    pub fn repair_units(&self) -> &[RepairUnit] {
        &self.repair_units
    }

    /// Stage ordinals in execution order.
    pub fn stage_ids(&self) -> Vec<StageId> {
        self.stages.iter().map(|s| s.id).collect()
    }

    /// Looks up a stage by ordinal.
    pub fn stage(&self, id: StageId) -> Option<&StageDefinition> {
        self.stages.iter().find(|s| s.id == id)
    }

    /// Looks up a stage by name or alias.
    pub fn find_by_name(&self, name: &str) -> Option<&StageDefinition> {
        self.stages.iter().find(|s| s.answers_to(name))
    }

    /// The first stage to execute.
    pub fn first(&self) -> StageId {
        self.stages[0].id
    }

    /// The final stage.
    pub fn last(&self) -> StageId {
        self.stages[self.stages.len() - 1].id
    }

    /// The stage after `id` in execution order, if any.
    pub fn next_after(&self, id: StageId) -> Option<StageId> {
        self.stages.iter().map(|s| s.id).find(|s| *s > id)
    }

    /// The repair unit whose last stage is `id`.
    pub fn repair_unit_ending_at(&self, id: StageId) -> Option<&RepairUnit> {
        self.repair_units.iter().find(|u| u.last_stage() == Some(id))
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// How a stage result came to be.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Disposition {
    /// The handler ran and produced valid output.
    #[default]
    Executed,
    /// The stage was skipped at the user's request; the result is a pass-through.
    Skipped {
        /// Why the stage was skipped.
        reason: String,
    },
    /// The handler had no candidate inputs and did no work.
    NothingToDo {
        /// What was missing.
        reason: String,
    },
    /// The model answered but its output could not be extracted.
    Degraded {
        /// Short extraction diagnostic.
        diagnostic: String,
    },
    /// The repair loop hit its cap; this is the best available result.
    OpenIssues {
        /// Repair unit that was exhausted.
        unit: RepairUnitName,
        /// Repair rounds executed.
        iterations: u32,
    },
}

/// Everything one stage execution produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    /// Freeform text (model output, or a rendered document).
    pub text: String,
    /// Parsed structured data. Shape depends on the stage's [`OutputKind`].
    pub data: Value,
    /// Token usage attributable to this execution.
    pub usage: Usage,
    /// One-line human summary.
    pub summary: String,
    /// How the result came to be.
    #[serde(default)]
    pub disposition: Disposition,
}

impl StageResult {
    /// A result from a handler that did its work.
    pub fn executed(text: impl Into<String>, data: Value, usage: Usage, summary: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            data,
            usage,
            summary: summary.into(),
            disposition: Disposition::Executed,
        }
    }

    /// A synthetic result for a stage the user asked to skip.
    pub fn pass_through(stage: &StageDefinition, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self {
            text: String::new(),
            data: json!({ "skipped": true, "reason": reason }),
            usage: Usage::none(),
            summary: format!("{} skipped: {reason}", stage.name),
            disposition: Disposition::Skipped { reason },
        }
    }

    /// An explicit "nothing to do" result for a stage with no candidate inputs.
    pub fn nothing_to_do(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self {
            text: String::new(),
            data: json!({ "status": "nothing_to_do", "reason": reason }),
            usage: Usage::none(),
            summary: format!("nothing to do: {reason}"),
            disposition: Disposition::NothingToDo { reason },
        }
    }

    /// A result whose structured output could not be extracted.
    ///
    /// The raw text is kept; `data` is `null` so no consumer mistakes it for
    /// valid output.
    pub fn degraded(text: impl Into<String>, usage: Usage, diagnostic: impl Into<String>) -> Self {
        let diagnostic = diagnostic.into();
        Self {
            text: text.into(),
            data: Value::Null,
            usage,
            summary: format!("output could not be parsed: {diagnostic}"),
            disposition: Disposition::Degraded { diagnostic },
        }
    }

    /// `true` if the data carries `"needs_repair": true`.
    pub fn needs_repair(&self) -> bool {
        self.data.get("needs_repair").and_then(Value::as_bool).unwrap_or(false)
    }

    /// Reads a feedback string from `field` of the data, if present and non-empty.
    pub fn feedback(&self, field: &str) -> Option<String> {
        self.data
            .get(field)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    }

    /// `true` for skipped or nothing-to-do results.
    pub fn is_vacant(&self) -> bool {
        matches!(
            self.disposition,
            Disposition::Skipped { .. } | Disposition::NothingToDo { .. }
        )
    }

    /// `true` for degraded results.
    pub fn is_degraded(&self) -> bool {
        matches!(self.disposition, Disposition::Degraded { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn research_definition_is_valid_and_ordered() {
        let def = PipelineDefinition::research();
        assert_eq!(def.stage_ids().len(), 6);
        assert_eq!(def.first(), StageId::new(0));
        assert_eq!(def.last(), StageId::new(5));
        assert_eq!(def.next_after(StageId::new(2)), Some(StageId::new(3)));
        assert_eq!(def.next_after(StageId::new(5)), None);
        let unit = def.repair_unit_ending_at(StageId::new(4)).expect("unit");
        assert_eq!(unit.max_iterations, 2);
        assert!(def.repair_unit_ending_at(StageId::new(3)).is_none());
    }

    #[test]
    fn stage_lookup_accepts_aliases_case_insensitively() {
        let def = PipelineDefinition::research();
        assert_eq!(def.find_by_name("Web Search").map(|s| s.id), Some(StageId::new(1)));
        assert_eq!(def.find_by_name("VERIFY").map(|s| s.id), Some(StageId::new(4)));
        assert!(def.find_by_name("deploy").is_none());
    }

    #[test]
    fn rejects_descending_ordinals() {
        let stages = vec![
            StageDefinition::new(1, "a", StageKind::Pure, OutputKind::Generic),
            StageDefinition::new(0, "b", StageKind::Pure, OutputKind::Generic),
        ];
        assert_matches!(
            PipelineDefinition::new("bad", stages, vec![]),
            Err(PipelineError::ConfigurationError { .. })
        );
    }

    #[test]
    fn rejects_pause_point_inside_repair_unit() {
        let unit = RepairUnitName::new("u").unwrap();
        let stages = vec![
            StageDefinition {
                repair_unit: Some(unit.clone()),
                ..StageDefinition::new(0, "a", StageKind::Model, OutputKind::Generic).pause_after()
            },
            StageDefinition {
                repair_unit: Some(unit.clone()),
                ..StageDefinition::new(1, "b", StageKind::Tool, OutputKind::Generic)
            },
        ];
        let units = vec![RepairUnit {
            name: unit,
            stages: vec![StageId::new(0), StageId::new(1)],
            max_iterations: 1,
            feedback_field: "fb".into(),
        }];
        assert_matches!(
            PipelineDefinition::new("bad", stages, units),
            Err(PipelineError::ConfigurationError { .. })
        );
    }

    #[test]
    fn deserialisation_runs_validation() {
        let raw = r#"{"name":"x","stages":[]}"#;
        assert!(serde_json::from_str::<PipelineDefinition>(raw).is_err());

        let raw = r#"{"name":"x","stages":[{"id":0,"name":"only","kind":"pure"}]}"#;
        let def: PipelineDefinition = serde_json::from_str(raw).expect("valid");
        assert_eq!(def.stage(StageId::new(0)).map(|s| s.output), Some(OutputKind::Generic));
    }

    #[test]
    fn needs_repair_and_feedback_read_from_data() {
        let result = StageResult::executed(
            "",
            json!({"needs_repair": true, "repair_instructions": "  fix citation 3 "}),
            Usage::none(),
            "",
        );
        assert!(result.needs_repair());
        assert_eq!(result.feedback("repair_instructions").as_deref(), Some("fix citation 3"));
        assert_eq!(result.feedback("missing"), None);
        assert!(!StageResult::nothing_to_do("no citations").needs_repair());
    }
}
