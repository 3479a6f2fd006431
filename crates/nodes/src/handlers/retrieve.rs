//! Knowledge-base retrieval with cross-query and cross-run deduplication.

use std::collections::BTreeSet;

use async_trait::async_trait;
use pipeline::evidence::{Evidence, EvidenceRole};
use pipeline::extract::{FieldKind, OutputSchema};
use pipeline::stage::StageResult;
use pipeline::tools::ToolBridge;
use pipeline::{ToolName, Usage};
use serde::Deserialize;
use serde_json::json;

use crate::handler::{summarize, StageError, StageInput, ToolHandler};

#[derive(Debug, Deserialize)]
struct SearchResponse {
    results: Vec<Evidence>,
}

/// Runs one `hybrid_search` per sub-query and merges the results.
#[derive(Debug, Clone)]
pub struct RetrievalStage {
    tool: ToolName,
    max_results_per_query: u32,
    cap: usize,
}

impl RetrievalStage {
    pub fn new(tool: ToolName, max_results_per_query: u32, cap: usize) -> Self {
        Self {
            tool,
            max_results_per_query,
            cap,
        }
    }
}

#[async_trait]
impl ToolHandler for RetrievalStage {
    #[tracing::instrument(skip_all, fields(stage = %input.stage.name, tool = %self.tool))]
    async fn execute(&self, input: &StageInput<'_>, tools: &ToolBridge) -> Result<StageResult, StageError> {
        let queries = input.sub_queries();
        if queries.is_empty() {
            return Ok(StageResult::nothing_to_do("no queries to search"));
        }

        let schema = OutputSchema::object(self.tool.as_str()).require("results", FieldKind::Array);
        let mut kept: Vec<Evidence> = Vec::new();
        let mut ids = BTreeSet::new();
        let mut dropped_seen = 0usize;
        let mut dropped_duplicates = 0usize;
        let mut failed = 0usize;

        for query in &queries {
            let args = json!({ "query": query, "max_results": self.max_results_per_query });
            let response = match tools.call::<SearchResponse>(&self.tool, args, &schema).await {
                Ok(response) => response,
                Err(e) => {
                    tracing::warn!(query = %query, error = %e, "search failed; treating as no results");
                    failed += 1;
                    continue;
                }
            };
            for (rank, mut item) in response.results.into_iter().enumerate() {
                if input.follow_up.is_some_and(|f| f.has_seen(&item.id)) {
                    dropped_seen += 1;
                    continue;
                }
                if !ids.insert(item.id.clone()) {
                    dropped_duplicates += 1;
                    continue;
                }
                item.role = EvidenceRole::for_rank(rank);
                item.query = Some(query.clone());
                kept.push(item);
            }
        }

        if kept.len() > self.cap {
            // Keep the strongest roles first, then the best scores.
            kept.sort_by(|a, b| a.role.cmp(&b.role).then(b.score.total_cmp(&a.score)));
            kept.truncate(self.cap);
        }
        tracing::info!(
            kept = kept.len(),
            dropped_seen,
            dropped_duplicates,
            failed_queries = failed,
            "retrieval merged"
        );

        let data = json!({
            "evidence": kept,
            "dropped_seen": dropped_seen,
            "dropped_duplicates": dropped_duplicates,
        });
        let summary = summarize(input.stage.output, &data);
        Ok(StageResult::executed(String::new(), data, Usage::none(), summary))
    }
}
