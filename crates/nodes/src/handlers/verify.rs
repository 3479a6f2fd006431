//! Citation verification; the tail of the synthesis repair unit.

use async_trait::async_trait;
use pipeline::extract::{FieldKind, OutputSchema};
use pipeline::shapes::{CitationReport, VerificationView};
use pipeline::stage::{Disposition, OutputKind, StageResult};
use pipeline::tools::ToolBridge;
use pipeline::{Diagnostic, DiagnosticSeverity, ToolName, Usage, VerificationScore};
use serde_json::json;

use crate::handler::{summarize, StageError, StageInput, ToolHandler};

const MALFORMED_ANSWER_FEEDBACK: &str = "The previous answer could not be read. Respond with exactly one JSON \
object containing an `answer` string and a `citations` array, with no text outside it.";

/// Checks every citation of the answer against the knowledge base.
#[derive(Debug, Clone)]
pub struct VerificationStage {
    tool: ToolName,
}

impl VerificationStage {
    pub fn new(tool: ToolName) -> Self {
        Self { tool }
    }
}

fn outcome(input: &StageInput<'_>, view: &VerificationView) -> StageResult {
    let data = view.to_value();
    let summary = summarize(input.stage.output, &data);
    StageResult::executed(String::new(), data, Usage::none(), summary)
}

#[async_trait]
impl ToolHandler for VerificationStage {
    #[tracing::instrument(skip_all, fields(stage = %input.stage.name, iteration = input.iteration))]
    async fn execute(&self, input: &StageInput<'_>, tools: &ToolBridge) -> Result<StageResult, StageError> {
        let Some((_, answer_result)) = input.prior_of(OutputKind::Answer) else {
            return Ok(StageResult::nothing_to_do("there is no answer to verify"));
        };
        if let Disposition::Degraded { diagnostic } = &answer_result.disposition {
            // Nothing to send to the tool; ask the next round for parseable output.
            let view = VerificationView {
                needs_repair: true,
                score: VerificationScore::zero(),
                issues: vec![Diagnostic {
                    evidence: None,
                    severity: DiagnosticSeverity::Blocking,
                    category: "malformed_answer".to_string(),
                    message: format!("the answer could not be parsed: {diagnostic}"),
                }],
                repair_instructions: Some(MALFORMED_ANSWER_FEEDBACK.to_string()),
            };
            return Ok(outcome(input, &view));
        }
        if answer_result.is_vacant() {
            return Ok(StageResult::nothing_to_do("the answer stage produced nothing"));
        }

        let citations = input.citations();
        if citations.is_empty() {
            return Ok(StageResult::nothing_to_do("the answer has no citations"));
        }

        let args = json!({
            "citations": citations
                .iter()
                .map(|c| json!({ "paragraph_id": c.evidence_id, "claim": c.claim }))
                .collect::<Vec<_>>(),
        });
        let schema = OutputSchema::object(self.tool.as_str()).require("passed", FieldKind::Bool);
        let view = match tools.call::<CitationReport>(&self.tool, args, &schema).await {
            Ok(report) => VerificationView::from_report(&report),
            Err(e) => {
                tracing::warn!(error = %e, "citation verification unavailable; accepting the answer unverified");
                VerificationView {
                    needs_repair: false,
                    score: VerificationScore::zero(),
                    issues: vec![Diagnostic {
                        evidence: None,
                        severity: DiagnosticSeverity::Informational,
                        category: "unverified".to_string(),
                        message: format!("citations could not be verified ({e})"),
                    }],
                    repair_instructions: None,
                }
            }
        };
        tracing::info!(
            score = %view.score,
            issues = view.issues.len(),
            needs_repair = view.needs_repair,
            "citations verified"
        );
        Ok(outcome(input, &view))
    }
}
