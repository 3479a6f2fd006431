//! Retrieved evidence and citations.

use serde::{Deserialize, Serialize};

use crate::EvidenceId;

/// How central a piece of evidence is to the question.
///
/// Drives the context assembler's 60/30/10 token split.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceRole {
    #[default]
    Primary,
    Supporting,
    Context,
}

impl EvidenceRole {
    /// Role for the item at `rank` (0-based) within one sub-query's results.
    pub fn for_rank(rank: usize) -> Self {
        match rank {
            0..=2 => Self::Primary,
            3..=7 => Self::Supporting,
            _ => Self::Context,
        }
    }

    /// Lower-case label used in tags.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Supporting => "supporting",
            Self::Context => "context",
        }
    }
}

/// One retrieved knowledge-base item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    /// Identifier assigned by the knowledge base.
    pub id: EvidenceId,
    /// Human reference, e.g. `"ISA 315.12(a)"`.
    #[serde(default, alias = "paragraph_ref")]
    pub reference: String,
    /// Source text.
    pub content: String,
    /// Retrieval confidence, higher is better.
    #[serde(default, alias = "confidence")]
    pub score: f64,
    /// Role assigned at retrieval.
    #[serde(default)]
    pub role: EvidenceRole,
    /// Sub-query that found it.
    #[serde(default)]
    pub query: Option<String>,
}

/// A claim in the answer attributed to one evidence item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    /// Cited evidence.
    #[serde(alias = "paragraph_id")]
    pub evidence_id: EvidenceId,
    /// The attributed claim.
    #[serde(default)]
    pub claim: String,
}
