//! Stagewright session persistence adapter.
//!
//! Implements [`pipeline::persistence::StateStore`] twice:
//!
//! - [`FileStateStore`]: one directory per session under a root, written with
//!   temp-file + rename so readers never see a partial snapshot.
//! - [`MemoryStateStore`]: in-process maps, for tests and dry runs.
//!
//! ## Layout
//!
//! ```text
//! <root>/
//!   sessions/<session-id>/state.json    PipelineState snapshot
//!   sessions/<session-id>/answer.json   FinalAnswer of a completed run
//!   active/<agent-slug>                 id of the agent's active session
//! ```
//!
//! ## Architectural Layer
//!
//! **Infrastructure.** The [`pipeline`] crate sees only the `StateStore` trait.

mod file;
mod memory;

pub use file::FileStateStore;
pub use memory::MemoryStateStore;
