//! Structured-output extraction from free-form model text.
//!
//! [`StructuredOutputExtractor::extract`] tries, in order:
//!
//! 1. the whole text as JSON;
//! 2. the first fenced code block;
//! 3. the first top-level `{...}` or `[...]` region.
//!
//! Each candidate is validated against an [`OutputSchema`]; the first valid
//! candidate wins. Total failure returns an [`ExtractionFailure`] carrying the
//! raw text and every attempt. Truncated output is only diagnosed, never
//! patched up: a "repaired" JSON document would parse but be incomplete.

use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

use crate::tokens::likely_truncated;
use crate::TokenCount;

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

/// JSON type expected for a required field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    String,
    Number,
    Bool,
    Array,
    Object,
    Any,
}

impl FieldKind {
    fn matches(self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Bool => value.is_boolean(),
            Self::Array => value.is_array(),
            Self::Object => value.is_object(),
            Self::Any => !value.is_null(),
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Bool => "boolean",
            Self::Array => "array",
            Self::Object => "object",
            Self::Any => "non-null value",
        }
    }
}

/// Minimal structural schema: the value must be an object satisfying at least
/// one alternative set of required fields.
///
/// ```
/// use pipeline::extract::{FieldKind, OutputSchema};
///
/// let schema = OutputSchema::object("analysis")
///     .require("sub_queries", FieldKind::Array)
///     .or()
///     .require("queries", FieldKind::Array);
/// assert!(schema.validate(&serde_json::json!({"queries": []})).is_ok());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct OutputSchema {
    name: String,
    alternatives: Vec<Vec<(String, FieldKind)>>,
}

impl OutputSchema {
    /// An object schema with no required fields yet.
    pub fn object(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            alternatives: vec![Vec::new()],
        }
    }

    /// Requires `field` of `kind` in the current alternative.
    pub fn require(mut self, field: impl Into<String>, kind: FieldKind) -> Self {
        if let Some(current) = self.alternatives.last_mut() {
            current.push((field.into(), kind));
        }
        self
    }

    /// Starts a new alternative.
    pub fn or(mut self) -> Self {
        self.alternatives.push(Vec::new());
        self
    }

    /// Schema name, used in diagnostics.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Checks `value`; the error names the first unmet requirement of the
    /// closest alternative.
    pub fn validate(&self, value: &Value) -> Result<(), String> {
        let Some(object) = value.as_object() else {
            return Err(format!("{} must be a JSON object", self.name));
        };
        let mut first_error = None;
        for alternative in &self.alternatives {
            let missing = alternative.iter().find(|(field, kind)| {
                !object.get(field.as_str()).is_some_and(|v| kind.matches(v))
            });
            match missing {
                None => return Ok(()),
                Some((field, kind)) => {
                    first_error.get_or_insert_with(|| format!("{}: field '{field}' must be a {}", self.name, kind.label()));
                }
            }
        }
        Err(first_error.unwrap_or_else(|| format!("{} did not match", self.name)))
    }
}

// ---------------------------------------------------------------------------
// Extraction
// ---------------------------------------------------------------------------

/// Extraction strategy, in the order they are tried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    WholeText,
    FencedBlock,
    BracketedRegion,
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::WholeText => "whole text",
            Self::FencedBlock => "fenced block",
            Self::BracketedRegion => "bracketed region",
        })
    }
}

/// One failed strategy.
#[derive(Debug, Clone, PartialEq)]
pub struct Attempt {
    /// Strategy tried.
    pub strategy: Strategy,
    /// Why its candidate was rejected (or that none was found).
    pub reason: String,
}

/// A successful extraction.
#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    /// Validated value.
    pub value: Value,
    /// Strategy that produced it.
    pub strategy: Strategy,
}

/// Every strategy failed.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("no valid {schema} output found ({})", summarize(.attempts))]
pub struct ExtractionFailure {
    /// Schema name.
    pub schema: String,
    /// The unmodified model text.
    pub raw: String,
    /// Why each strategy failed.
    pub attempts: Vec<Attempt>,
    /// Output usage reached the truncation threshold. Diagnostic only.
    pub likely_truncated: bool,
}

fn summarize(attempts: &[Attempt]) -> String {
    attempts
        .iter()
        .map(|a| format!("{}: {}", a.strategy, a.reason))
        .collect::<Vec<_>>()
        .join("; ")
}

impl ExtractionFailure {
    /// Short diagnostic suitable for a degraded stage result.
    pub fn diagnostic(&self) -> String {
        if self.likely_truncated {
            format!("{self} (output likely truncated at the token limit)")
        } else {
            self.to_string()
        }
    }
}

/// Stateless, deterministic extractor.
#[derive(Debug, Clone, Copy, Default)]
pub struct StructuredOutputExtractor;

impl StructuredOutputExtractor {
    /// Creates an extractor.
    pub fn new() -> Self {
        Self
    }

    /// Extracts the first candidate that parses and satisfies `schema`.
    pub fn extract(&self, text: &str, schema: &OutputSchema) -> Result<Extraction, ExtractionFailure> {
        let mut attempts = Vec::with_capacity(3);
        let candidates: [(Strategy, Option<&str>); 3] = [
            (Strategy::WholeText, Some(text.trim())),
            (Strategy::FencedBlock, first_fenced_block(text)),
            (Strategy::BracketedRegion, first_bracketed_region(text)),
        ];
        for (strategy, candidate) in candidates {
            let Some(candidate) = candidate.filter(|c| !c.is_empty()) else {
                attempts.push(Attempt {
                    strategy,
                    reason: "no candidate".to_string(),
                });
                continue;
            };
            match serde_json::from_str::<Value>(candidate) {
                Ok(value) => match schema.validate(&value) {
                    Ok(()) => return Ok(Extraction { value, strategy }),
                    Err(reason) => attempts.push(Attempt { strategy, reason }),
                },
                Err(e) => attempts.push(Attempt {
                    strategy,
                    reason: format!("invalid JSON: {e}"),
                }),
            }
        }
        Err(ExtractionFailure {
            schema: schema.name().to_string(),
            raw: text.to_string(),
            attempts,
            likely_truncated: false,
        })
    }

    /// [`Self::extract`], additionally flagging failures whose output usage
    /// reached the truncation threshold of `budget`.
    pub fn extract_with_usage(
        &self,
        text: &str,
        schema: &OutputSchema,
        output_tokens: TokenCount,
        budget: TokenCount,
    ) -> Result<Extraction, ExtractionFailure> {
        self.extract(text, schema).map_err(|mut failure| {
            failure.likely_truncated = likely_truncated(output_tokens, budget);
            if failure.likely_truncated {
                tracing::warn!(
                    schema = %failure.schema,
                    output_tokens = %output_tokens,
                    budget = %budget,
                    "structured output failed to parse at the token limit"
                );
            }
            failure
        })
    }

    /// Extracts and deserialises into `T`.
    pub fn extract_as<T: DeserializeOwned>(
        &self,
        text: &str,
        schema: &OutputSchema,
    ) -> Result<(T, Strategy), ExtractionFailure> {
        let extraction = self.extract(text, schema)?;
        match serde_json::from_value(extraction.value) {
            Ok(typed) => Ok((typed, extraction.strategy)),
            Err(e) => Err(ExtractionFailure {
                schema: schema.name().to_string(),
                raw: text.to_string(),
                attempts: vec![Attempt {
                    strategy: extraction.strategy,
                    reason: format!("type mismatch: {e}"),
                }],
                likely_truncated: false,
            }),
        }
    }
}

/// Body of the first ```` ``` ```` fenced block, without its info string.
fn first_fenced_block(text: &str) -> Option<&str> {
    let start = text.find("```")?;
    let after_fence = &text[start + 3..];
    let body_start = after_fence.find('\n')? + 1;
    let body = &after_fence[body_start..];
    let end = body.find("```")?;
    Some(body[..end].trim())
}

/// The first balanced `{...}` or `[...]` region, honouring JSON strings.
fn first_bracketed_region(text: &str) -> Option<&str> {
    let start = text.find(['{', '['])?;
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &b) in bytes[start..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' | b'[' => depth += 1,
            b'}' | b']' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(&text[start..=start + offset]);
                }
            }
            _ => {}
        }
    }
    None
}
