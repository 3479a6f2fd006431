//! Human-readable pause messages.
//!
//! The formatter normalises a stage's data through [`crate::shapes::normalize`]
//! and renders the canonical view. The raw payload never forms the body of a
//! message; it is attached only as collapsed supplementary detail. When no
//! known shape matches, the body is an explicit "could not summarize" notice.

use serde::{Deserialize, Serialize};

use crate::evidence::EvidenceRole;
use crate::shapes::{self, NormalizationPath, StageView};
use crate::stage::{StageDefinition, StageResult};
use crate::tokens::truncate_to_tokens;
use crate::{StageId, TokenCount};

/// Heading used when no output shape could be recognised.
pub const COULD_NOT_SUMMARIZE: &str = "Could not summarize this stage's output; the raw output is attached below.";

/// Size cap on the collapsed raw detail.
const RAW_DETAIL_TOKENS: TokenCount = TokenCount::new(2_000);

/// Hits listed per calibration pause.
const MAX_LISTED_HITS: usize = 8;

/// A rendered pause message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PauseMessage {
    pub stage: StageId,
    pub title: String,
    /// Deterministic summary of the canonical view.
    pub body: String,
    /// Raw payload, shown collapsed.
    pub raw_detail: Option<String>,
    /// Instructions for answering the pause.
    pub prompt: String,
    /// How the body was produced.
    pub path: NormalizationPath,
}

impl PauseMessage {
    /// Markdown rendering with the raw detail in a collapsed block.
    pub fn to_markdown(&self) -> String {
        let mut out = format!("### {}\n\n{}\n", self.title, self.body.trim_end());
        if let Some(raw) = &self.raw_detail {
            out.push_str("\n<details>\n<summary>Raw output</summary>\n\n```\n");
            out.push_str(raw.trim_end());
            out.push_str("\n```\n</details>\n");
        }
        out.push('\n');
        out.push_str(&self.prompt);
        out.push('\n');
        out
    }
}

/// Renders pause messages. Stateless and deterministic.
#[derive(Debug, Clone, Copy, Default)]
pub struct PauseMessageFormatter;

impl PauseMessageFormatter {
    pub fn new() -> Self {
        Self
    }

    /// Formats the pause raised after `stage`; `next` is the stage that runs
    /// on resume.
    pub fn format(&self, stage: &StageDefinition, result: &StageResult, next: Option<&StageDefinition>) -> PauseMessage {
        let normalized = shapes::normalize(stage.output, &result.data);
        let title = format!("Stage {} ({}) complete", stage.id, stage.name);
        let prompt = match next {
            Some(next) => format!(
                "Reply `proceed` to continue with {}, add guidance for it, `skip {}`, or `abort`.",
                next.name, next.name
            ),
            None => "Reply `proceed` to finish, or `abort`.".to_string(),
        };

        let (body, raw_detail) = match render(&normalized.view) {
            Some(body) => {
                let raw = (!result.data.is_null()).then(|| raw_json(&result.data));
                (body, raw)
            }
            None => {
                let raw = if result.text.trim().is_empty() {
                    raw_json(&result.data)
                } else {
                    truncate_to_tokens(&result.text, RAW_DETAIL_TOKENS).to_string()
                };
                (COULD_NOT_SUMMARIZE.to_string(), Some(raw))
            }
        };

        PauseMessage {
            stage: stage.id,
            title,
            body,
            raw_detail,
            prompt,
            path: normalized.path,
        }
    }
}

fn raw_json(data: &serde_json::Value) -> String {
    let pretty = serde_json::to_string_pretty(data).unwrap_or_else(|_| data.to_string());
    truncate_to_tokens(&pretty, RAW_DETAIL_TOKENS).to_string()
}

fn render(view: &StageView) -> Option<String> {
    let body = match view {
        StageView::Analysis(v) => {
            let mut out = String::new();
            if let Some(summary) = &v.summary {
                out.push_str(summary);
                out.push_str("\n\n");
            }
            if v.sub_queries.is_empty() {
                out.push_str("No sub-queries were proposed.");
            } else {
                out.push_str(&format!("Proposed {} sub-queries:\n", v.sub_queries.len()));
                for (i, q) in v.sub_queries.iter().enumerate() {
                    out.push_str(&format!("{}. {}", i + 1, q.query));
                    if let Some(rationale) = q.rationale.as_deref().filter(|r| !r.is_empty()) {
                        out.push_str(&format!(" ({rationale})"));
                    }
                    out.push('\n');
                }
            }
            out
        }
        StageView::Calibration(v) => {
            let mut out = format!("Found {} web results.\n", v.hits.len());
            for hit in v.hits.iter().take(MAX_LISTED_HITS) {
                let title = if hit.title.is_empty() { &hit.url } else { &hit.title };
                out.push_str(&format!("- [{title}]({})\n", hit.url));
            }
            if v.hits.len() > MAX_LISTED_HITS {
                out.push_str(&format!("- and {} more\n", v.hits.len() - MAX_LISTED_HITS));
            }
            if !v.hints.is_empty() {
                out.push_str("\nTerminology hints:\n");
                v.hints.iter().for_each(|h| out.push_str(&format!("- {h}\n")));
            }
            if !v.warnings.is_empty() {
                out.push_str("\nWarnings:\n");
                v.warnings.iter().for_each(|w| out.push_str(&format!("- {w}\n")));
            }
            out
        }
        StageView::Evidence(v) => {
            let count = |role| v.items.iter().filter(|e| e.role == role).count();
            let mut out = format!(
                "Retrieved {} evidence items ({} primary, {} supporting, {} context).",
                v.items.len(),
                count(EvidenceRole::Primary),
                count(EvidenceRole::Supporting),
                count(EvidenceRole::Context)
            );
            if v.dropped_seen > 0 {
                out.push_str(&format!(" {} already presented in the previous answer were left out.", v.dropped_seen));
            }
            out
        }
        StageView::Answer(v) => {
            let headings: Vec<&str> = v
                .sections
                .iter()
                .map(|s| s.heading.as_str())
                .filter(|h| !h.is_empty())
                .collect();
            let mut out = format!("Drafted an answer with {} citations.", v.citations.len());
            if !headings.is_empty() {
                out.push_str(&format!(" Sections: {}.", headings.join(", ")));
            }
            out
        }
        StageView::Verification(v) => {
            let mut out = format!(
                "Verification score {:.0}%, {}.",
                v.score.as_f64() * 100.0,
                if v.needs_repair { "repair needed" } else { "passed" }
            );
            for issue in &v.issues {
                out.push_str(&format!("\n- {}", issue.message));
            }
            out
        }
        StageView::Document(v) => format!(
            "Rendered the final document ({} sources, {} open issues).",
            v.evidence_ids.len(),
            v.open_issues.len()
        ),
        StageView::PassThrough { reason } => format!("Skipped: {reason}."),
        StageView::NothingToDo { reason } => format!("Nothing to do: {reason}."),
        StageView::Summary { text } => text.clone(),
        StageView::Unrecognized => return None,
    };
    Some(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::PipelineDefinition;
    use crate::Usage;
    use serde_json::json;

    fn stages() -> PipelineDefinition {
        PipelineDefinition::research()
    }

    #[test]
    fn analysis_pause_lists_sub_queries_not_raw_json() {
        let def = stages();
        let result = StageResult::executed(
            "raw",
            json!({"sub_queries": [{"query": "risk assessment", "rationale": "core"}], "summary": "Two angles."}),
            Usage::none(),
            "",
        );
        let message = PauseMessageFormatter::new().format(&def.stages()[0], &result, def.stages().get(1));
        assert_eq!(message.path, NormalizationPath::AnalysisSubQueries);
        assert!(message.body.contains("1. risk assessment (core)"));
        assert!(!message.body.contains('{'));
        assert!(message.prompt.contains("skip calibrate"));
        assert!(message.to_markdown().contains("<details>"));
    }

    #[test]
    fn unparseable_output_renders_the_fallback() {
        let def = stages();
        let result = StageResult::degraded("I think the answer is probably yes", Usage::new(10, 10), "no JSON");
        let message = PauseMessageFormatter::new().format(&def.stages()[1], &result, def.stages().get(2));
        assert_eq!(message.path, NormalizationPath::Unrecognized);
        assert_eq!(message.body, COULD_NOT_SUMMARIZE);
        assert!(!message.body.contains("probably yes"));
        assert_eq!(message.raw_detail.as_deref(), Some("I think the answer is probably yes"));
    }

    #[test]
    fn skipped_stage_is_described() {
        let def = stages();
        let result = StageResult::pass_through(&def.stages()[1], "user request");
        let message = PauseMessageFormatter::new().format(&def.stages()[1], &result, None);
        assert_eq!(message.body, "Skipped: user request.");
        assert_eq!(message.path, NormalizationPath::PassThrough);
    }

    #[test]
    fn formatting_is_deterministic() {
        let def = stages();
        let result = StageResult::executed(
            "",
            json!({"results": [{"title": "IAASB", "url": "https://iaasb.org"}], "warnings": ["slow"]}),
            Usage::none(),
            "",
        );
        let f = PauseMessageFormatter::new();
        let a = f.format(&def.stages()[1], &result, def.stages().get(2));
        let b = f.format(&def.stages()[1], &result, def.stages().get(2));
        assert_eq!(a, b);
        assert!(a.body.contains("- [IAASB](https://iaasb.org)"));
    }
}
