//! Web calibration: one `web_search` call per sub-query.

use async_trait::async_trait;
use pipeline::extract::{FieldKind, OutputSchema};
use pipeline::shapes::WebHit;
use pipeline::stage::StageResult;
use pipeline::tools::ToolBridge;
use pipeline::{ToolName, Usage};
use serde::Deserialize;
use serde_json::json;

use crate::handler::{summarize, StageError, StageInput, ToolHandler};

#[derive(Debug, Deserialize)]
struct WebSearchResponse {
    #[serde(default)]
    results: Vec<WebHit>,
    #[serde(default)]
    analysis_hints: Vec<String>,
    #[serde(default)]
    warnings: Vec<String>,
}

/// Calibrates terminology against the web before retrieval.
#[derive(Debug, Clone)]
pub struct CalibrationStage {
    tool: ToolName,
    max_results_per_query: u32,
}

impl CalibrationStage {
    pub fn new(tool: ToolName, max_results_per_query: u32) -> Self {
        Self {
            tool,
            max_results_per_query,
        }
    }
}

#[async_trait]
impl ToolHandler for CalibrationStage {
    #[tracing::instrument(skip_all, fields(stage = %input.stage.name, tool = %self.tool))]
    async fn execute(&self, input: &StageInput<'_>, tools: &ToolBridge) -> Result<StageResult, StageError> {
        let queries = input.sub_queries();
        if queries.is_empty() {
            return Ok(StageResult::nothing_to_do("no queries to calibrate"));
        }

        let schema = OutputSchema::object(self.tool.as_str()).require("results", FieldKind::Array);
        let mut hits = Vec::new();
        let mut hints = Vec::new();
        let mut warnings = Vec::new();
        for query in &queries {
            let args = json!({ "queries": [query], "max_results_per_query": self.max_results_per_query });
            match tools.call::<WebSearchResponse>(&self.tool, args, &schema).await {
                Ok(response) => {
                    hits.extend(response.results.into_iter().map(|mut hit| {
                        hit.query.get_or_insert_with(|| query.clone());
                        hit
                    }));
                    hints.extend(response.analysis_hints);
                    warnings.extend(response.warnings);
                }
                Err(e) => {
                    tracing::warn!(query = %query, error = %e, "web search failed; treating as no results");
                    warnings.push(format!("web search failed for \"{query}\""));
                }
            }
        }
        hints.dedup();

        let data = json!({
            "results": hits,
            "analysis_hints": hints,
            "warnings": warnings,
            "queries_executed": queries.len(),
        });
        let summary = summarize(input.stage.output, &data);
        Ok(StageResult::executed(String::new(), data, Usage::none(), summary))
    }
}
