//! Final document assembly. Pure and deterministic.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use pipeline::evidence::{Citation, Evidence};
use pipeline::shapes::DocumentView;
use pipeline::stage::{Disposition, OutputKind, StageResult};
use pipeline::{EvidenceId, Usage};

use crate::handler::{summarize, PureHandler, StageInput};

/// Renders the Markdown answer document and its compact answer fields.
#[derive(Debug, Clone, Copy, Default)]
pub struct RenderStage;

impl RenderStage {
    pub fn new() -> Self {
        Self
    }
}

impl PureHandler for RenderStage {
    fn execute(&self, input: &StageInput<'_>) -> StageResult {
        let evidence = input.evidence();
        let answer = input.answer();
        let citations: Vec<Citation> = answer.as_ref().map(|a| a.citations.clone()).unwrap_or_default();

        let answer_text = match (&answer, input.prior_of(OutputKind::Answer)) {
            (Some(view), _) => view.text.clone(),
            (None, Some((_, result))) => match &result.disposition {
                Disposition::Degraded { .. } if !result.text.trim().is_empty() => format!(
                    "_The answer could not be structured; the model's response is reproduced as written._\n\n{}",
                    result.text.trim()
                ),
                _ => format!("_No answer was produced: {}._", result.summary),
            },
            (None, None) => "_No answer was produced._".to_string(),
        };

        let open_issues = open_issues(input);
        let sources = sources(&citations, &evidence);

        let mut markdown = format!("# {}\n\n{}\n", input.question.trim(), answer_text.trim());
        if !sources.is_empty() {
            markdown.push_str("\n## Sources\n\n");
            for (n, (id, item)) in sources.iter().enumerate() {
                match item {
                    Some(e) if !e.reference.is_empty() => {
                        let _ = writeln!(markdown, "{}. {} (`{id}`)", n + 1, e.reference);
                    }
                    _ => {
                        let _ = writeln!(markdown, "{}. `{id}`", n + 1);
                    }
                }
            }
        }
        if !open_issues.is_empty() {
            markdown.push_str("\n## Open issues\n\n");
            for issue in &open_issues {
                let _ = writeln!(markdown, "- {issue}");
            }
        }

        let document = DocumentView {
            markdown: markdown.clone(),
            answer: answer_text,
            citations,
            sub_queries: input.sub_queries(),
            evidence_ids: sources.into_iter().map(|(id, _)| id).collect(),
            open_issues,
        };
        let data = serde_json::to_value(&document).unwrap_or_default();
        let summary = summarize(input.stage.output, &data);
        StageResult::executed(markdown, data, Usage::none(), summary)
    }
}

/// Cited evidence in order of first citation; all evidence when nothing was cited.
fn sources<'a>(citations: &[Citation], evidence: &'a [Evidence]) -> Vec<(EvidenceId, Option<&'a Evidence>)> {
    let by_id: BTreeMap<&EvidenceId, &Evidence> = evidence.iter().map(|e| (&e.id, e)).collect();
    let mut out: Vec<(EvidenceId, Option<&Evidence>)> = Vec::new();
    if citations.is_empty() {
        return evidence.iter().map(|e| (e.id.clone(), Some(e))).collect();
    }
    for c in citations {
        if out.iter().all(|(id, _)| id != &c.evidence_id) {
            out.push((c.evidence_id.clone(), by_id.get(&c.evidence_id).copied()));
        }
    }
    out
}

/// Issues left when a repair unit was exhausted.
fn open_issues(input: &StageInput<'_>) -> Vec<String> {
    let exhausted = input
        .prior
        .values()
        .find_map(|r| match &r.disposition {
            Disposition::OpenIssues { unit, iterations } => Some((unit.clone(), *iterations)),
            _ => None,
        });
    let Some((unit, iterations)) = exhausted else {
        return Vec::new();
    };
    let mut issues: Vec<String> = input
        .verification()
        .map(|v| v.issues.into_iter().map(|i| i.message).collect())
        .unwrap_or_default();
    if issues.is_empty() {
        issues.push(format!(
            "verification still failed after {iterations} repair rounds of '{unit}'"
        ));
    }
    issues
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeline::stage::PipelineDefinition;
    use pipeline::{RepairUnitName, StageId};
    use serde_json::json;

    fn run(prior: &BTreeMap<StageId, StageResult>) -> StageResult {
        let def = PipelineDefinition::research();
        let input = StageInput {
            stage: &def.stages()[5],
            pipeline: &def,
            question: "What does ISA 315 require?",
            guidance: None,
            prior,
            follow_up: None,
            repair_feedback: None,
            iteration: 0,
        };
        RenderStage::new().execute(&input)
    }

    fn evidence() -> StageResult {
        StageResult::executed(
            "",
            json!({"evidence": [
                {"id": "ip_1", "reference": "ISA 315.12", "content": "a"},
                {"id": "ip_2", "reference": "ISA 315.13", "content": "b"},
            ]}),
            Usage::none(),
            "",
        )
    }

    #[test]
    fn sources_follow_citation_order() {
        let mut prior = BTreeMap::new();
        prior.insert(StageId::new(2), evidence());
        prior.insert(
            StageId::new(3),
            StageResult::executed(
                "",
                json!({"answer": "## Risk\nIdentify risks [ip_2].", "citations": [
                    {"evidence_id": "ip_2", "claim": "x"},
                    {"evidence_id": "ip_2", "claim": "y"},
                    {"evidence_id": "ip_9", "claim": "z"},
                ]}),
                Usage::none(),
                "",
            ),
        );
        let result = run(&prior);
        assert!(result.text.starts_with("# What does ISA 315 require?"));
        assert!(result.text.contains("1. ISA 315.13 (`ip_2`)\n2. `ip_9`"));
        assert!(!result.text.contains("Open issues"));
        assert_eq!(result.data["evidence_ids"], json!(["ip_2", "ip_9"]));
    }

    #[test]
    fn exhausted_repair_adds_open_issues() {
        let mut prior = BTreeMap::new();
        prior.insert(StageId::new(2), evidence());
        prior.insert(
            StageId::new(3),
            StageResult::executed("", json!({"answer": "A.", "citations": []}), Usage::none(), ""),
        );
        let mut verify = StageResult::executed(
            "",
            json!({"needs_repair": true, "score": 0.5, "issues": [
                {"severity": "blocking", "category": "missing_source", "message": "cited source ip_7 does not exist"}
            ], "repair_instructions": "fix"}),
            Usage::none(),
            "",
        );
        verify.disposition = Disposition::OpenIssues {
            unit: RepairUnitName::new("synthesis").unwrap(),
            iterations: 2,
        };
        prior.insert(StageId::new(4), verify);
        let result = run(&prior);
        assert!(result.text.contains("## Open issues\n\n- cited source ip_7 does not exist"));
        assert_eq!(result.data["open_issues"].as_array().map(Vec::len), Some(1));
    }

    #[test]
    fn rendering_is_reproducible() {
        let mut prior = BTreeMap::new();
        prior.insert(StageId::new(2), evidence());
        assert_eq!(run(&prior), run(&prior));
        assert!(run(&prior).text.contains("_No answer was produced._"));
    }
}
