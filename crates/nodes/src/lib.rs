//! Stagewright stage handlers and pipeline orchestration.
//!
//! This crate holds the six built-in research stage handlers, the
//! [`StageExecutor`] that dispatches a stage to its handler, the
//! [`ToolLifecycleManager`] that scopes the tool connection to one invocation,
//! and the [`PipelineOrchestrator`] that drives the stage loop.
//!
//! ## Architectural Layer
//!
//! **Orchestration layer.** Handlers sequence calls between business logic in
//! the [`pipeline`] crate and the port traits it defines (language model, tool
//! channel, state store). They contain no infrastructure of their own.
//!
//! ## Module Layout
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`handler`] | Handler traits, [`StageInput`], [`StageError`] |
//! | [`handlers`] | Built-in research handlers and [`ResearchTools`] |
//! | [`executor`] | [`StageExecutor`] |
//! | [`tool_lifecycle`] | [`ToolLifecycleManager`] |
//! | [`orchestrator`] | [`PipelineOrchestrator`], [`RunExit`] |
//! | [`observers`] | Tracing, recording, and channel lifecycle observers |

pub mod executor;
pub mod handler;
pub mod handlers;
pub mod observers;
pub mod orchestrator;
pub mod tool_lifecycle;

pub use executor::StageExecutor;
pub use handler::{Handler, ModelHandler, PureHandler, StageError, StageInput, ToolHandler};
pub use handlers::ResearchTools;
pub use observers::{ChannelObserver, Observers, RecordingObserver, TracingObserver};
pub use orchestrator::{ExitReason, OrchestratorSettings, PipelineOrchestrator, RunExit};
pub use tool_lifecycle::ToolLifecycleManager;
