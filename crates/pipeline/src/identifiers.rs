//! Identifiers for sessions, stages, evidence and the other named things a run
//! refers to.
//!
//! Each is its own newtype, so an [`EvidenceId`] cannot be passed where a
//! [`SectionId`] is expected although both hold a string.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Declares a non-empty string identifier with `new`, `as_str` and `Display`.
macro_rules! string_id {
    (
        $(#[$attr:meta])*
        $name:ident
    ) => {
        $(#[$attr])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(String);

        impl $name {
            /// `None` for an empty string.
            pub fn new(value: impl Into<String>) -> Option<Self> {
                let value = value.into();
                (!value.is_empty()).then_some(Self(value))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

// ---------------------------------------------------------------------------
// Identifiers: UUID-backed (internally generated)
// ---------------------------------------------------------------------------

/// Identifies one pipeline run from creation through every pause and resume.
///
/// Generated once when a run starts; the persisted snapshot is addressed by it
/// and follow-up runs point back at it through `previous_session_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Generates a new random session identifier.
    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a [`SessionId`] from an existing UUID (e.g. deserialised from state).
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// Parses a session identifier from its hyphenated string form.
    pub fn parse(value: &str) -> Option<Self> {
        Uuid::parse_str(value.trim()).ok().map(Self)
    }

    /// Returns the underlying [`Uuid`].
    pub fn as_uuid(self) -> Uuid {
        self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Identifiers: ordinal
// ---------------------------------------------------------------------------

/// Ordinal identifier of a stage within a pipeline definition.
///
/// Stages execute in ascending ordinal order. Ordinals need not be dense but
/// must be unique within one definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StageId(u32);

impl StageId {
    /// Creates a stage identifier from a raw ordinal.
    pub const fn new(ordinal: u32) -> Self {
        Self(ordinal)
    }

    /// Returns the underlying ordinal.
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for StageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Identifiers: String-backed (configuration / external names)
// ---------------------------------------------------------------------------

string_id! {
    /// Identifies the agent (skill) that owns a run, e.g. `"deep-research"`.
    ///
    /// At most one run per agent is active at a time; the active-run marker is
    /// keyed by this slug.
    AgentSlug
}

string_id! {
    /// Name of a tool exposed by the external tool server (e.g. `"hybrid_search"`).
    ToolName
}

string_id! {
    /// Identifier of one retrieved piece of evidence, as assigned by the
    /// knowledge-base tool. Used for citation and cross-run deduplication.
    EvidenceId
}

string_id! {
    /// Stable identifier of a section within a completed answer.
    ///
    /// Derived deterministically from the section's position and heading so a
    /// follow-up run can refer back to it.
    SectionId
}

string_id! {
    /// Name of a repair unit declared in a pipeline definition.
    RepairUnitName
}
