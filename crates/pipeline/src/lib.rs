//! Core orchestration domain for Stagewright.
//!
//! This crate contains every domain concept, newtype identifier, shared primitive
//! type, and cross-cutting error type used throughout the pipeline, plus the port
//! traits infrastructure crates implement. Infrastructure crates never add domain
//! rules.
//!
//! ## Architectural Layer
//!
//! **Business logic + port definitions.** This crate has no I/O dependencies.
//! It defines *what* is needed; infrastructure crates define *how* to supply it.
//!
//! ## Module Layout
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`identifiers`] | Newtype domain identifiers (`SessionId`, `StageId`, `EvidenceId`, etc.) |
//! | [`types`] | Shared value types (`TokenCount`, `TokenCost`, `CostBudget`, `Diagnostic`, etc.) |
//! | [`errors`] | Pipeline-halting errors and [`RetryPolicy`] |
//! | [`stage`] | Stage and pipeline definitions, repair units, [`stage::StageResult`] |
//! | [`state`] | Event-sourced [`state::PipelineState`] and its snapshot format |
//! | [`cost`] | [`cost::CostTracker`] and model pricing |
//! | [`tokens`] | [`tokens::TokenBudgetEstimator`] |
//! | [`extract`] | [`extract::StructuredOutputExtractor`] and output schemas |
//! | [`shapes`] | Output-shape normalisers and canonical views |
//! | [`pause`] | [`pause::PauseMessageFormatter`] |
//! | [`context`] | [`context::ContextAssembler`] |
//! | [`evidence`] | Retrieved evidence and citations |
//! | [`follow_up`] | Follow-up context and its loader |
//! | [`intent`] | Parsing of pause responses |
//! | [`tools`] | Tool ports and [`tools::ToolBridge`] |
//! | [`llm`] | Language model port |
//! | [`persistence`] | State store port |
//! | [`lifecycle`] | Host-facing lifecycle events |

pub mod context;
pub mod cost;
pub mod errors;
pub mod evidence;
pub mod extract;
pub mod follow_up;
pub mod identifiers;
pub mod intent;
pub mod lifecycle;
pub mod llm;
pub mod pause;
pub mod persistence;
pub mod shapes;
pub mod stage;
pub mod state;
pub mod tokens;
pub mod tools;
pub mod types;

// Re-export everything at the crate root for ergonomic usage by downstream crates.
pub use errors::{PipelineError, RetryPolicy};
pub use identifiers::{AgentSlug, EvidenceId, RepairUnitName, SectionId, SessionId, StageId, ToolName};
pub use types::{
    CostBudget, Diagnostic, DiagnosticSeverity, Timestamp, TokenCost, TokenCount, Usage, VerificationScore,
};
