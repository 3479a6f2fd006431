//! Built-in stage handlers for the research pipeline.
//!
//! | Stage | Handler | Kind |
//! |-------|---------|------|
//! | analyze | [`ModelStage::analysis`] | model |
//! | calibrate | [`CalibrationStage`] | tool |
//! | retrieve | [`RetrievalStage`] | tool |
//! | synthesize | [`ModelStage::synthesis`] | model |
//! | verify | [`VerificationStage`] | tool |
//! | render | [`RenderStage`] | pure |

mod calibrate;
mod model;
mod render;
mod retrieve;
mod verify;

pub use calibrate::CalibrationStage;
pub use model::ModelStage;
pub use render::RenderStage;
pub use retrieve::RetrievalStage;
pub use verify::VerificationStage;

use pipeline::ToolName;
use serde::{Deserialize, Serialize};

/// Tool names and retrieval limits for the research handlers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResearchTools {
    pub web_search: ToolName,
    pub hybrid_search: ToolName,
    pub citation_verify: ToolName,
    pub web_results_per_query: u32,
    pub search_results_per_query: u32,
    /// Upper bound on evidence items passed downstream.
    pub evidence_cap: usize,
}

fn tool(name: &str) -> ToolName {
    ToolName::new(name).unwrap_or_else(|| unreachable!("built-in tool names are non-empty"))
}

impl Default for ResearchTools {
    fn default() -> Self {
        Self {
            web_search: tool("web_search"),
            hybrid_search: tool("hybrid_search"),
            citation_verify: tool("citation_verify"),
            web_results_per_query: 5,
            search_results_per_query: 20,
            evidence_cap: 40,
        }
    }
}
