//! Conservative parsing of a user's pause response.
//!
//! Only unambiguous instructions change control flow. An abort is the bare
//! command (`abort`, `cancel`, `stop`, optionally followed by `the run`,
//! `the pipeline` or `research`); the same words inside a sentence are
//! guidance. `skip` must name a stage that has not run yet and not be negated.
//! Anything else means "proceed", with the text passed on as guidance for the
//! next stage.

use std::collections::BTreeSet;

use crate::stage::{PipelineDefinition, StageKind};
use crate::StageId;

const ABORT_WORDS: &[&str] = &["abort", "cancel", "stop"];
const ABORT_OBJECTS: &[&[&str]] = &[&[], &["the", "run"], &["the", "pipeline"], &["research"]];
const NEGATIONS: &[&str] = &["not", "don't", "dont", "never", "no", "without", "doesn't", "shouldn't"];

/// What the user asked for.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserIntent {
    /// Stop the run.
    pub abort: bool,
    /// Stages to replace with pass-through results.
    pub skip: BTreeSet<StageId>,
    /// The response text, carried to the next stage when not empty.
    pub guidance: Option<String>,
}

impl UserIntent {
    /// Parses `text` answered at a pause; only stages strictly after
    /// `resume_from` (or at it, when `resume_from` has not run) are skippable.
    pub fn parse(text: &str, definition: &PipelineDefinition, resume_from: Option<StageId>) -> Self {
        let guidance = Some(text.trim().to_string()).filter(|t| !t.is_empty() && !is_bare_proceed(t));
        let words = words(text);

        if is_abort_command(text) {
            return Self {
                abort: true,
                skip: BTreeSet::new(),
                guidance,
            };
        }

        let mut skip = BTreeSet::new();
        for (i, word) in words.iter().enumerate() {
            if word != "skip" || negated(&words, i) {
                continue;
            }
            let rest = &words[i + 1..];
            let target = match rest {
                [stage, n, ..] if stage == "stage" => n.parse::<u32>().ok().and_then(|n| definition.stage(StageId::new(n))),
                [first, second, ..] => definition
                    .find_by_name(&format!("{first} {second}"))
                    .or_else(|| definition.find_by_name(first)),
                [first] => definition.find_by_name(first),
                [] => None,
            };
            let Some(target) = target else { continue };
            let skippable = resume_from.map_or(true, |from| target.id >= from)
                && !(target.id == definition.last() && target.kind == StageKind::Pure);
            if skippable {
                skip.insert(target.id);
            }
        }

        Self {
            abort: false,
            skip,
            guidance,
        }
    }

    /// `true` when the response neither aborts nor skips.
    pub fn is_proceed(&self) -> bool {
        !self.abort && self.skip.is_empty()
    }
}

fn words(text: &str) -> Vec<String> {
    text.split(|c: char| !(c.is_alphanumeric() || c == '\'' || c == '_' || c == '-'))
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .collect()
}

/// A negation in the two words before `index`.
fn negated(words: &[String], index: usize) -> bool {
    words[index.saturating_sub(2)..index]
        .iter()
        .any(|w| NEGATIONS.contains(&w.as_str()))
}

/// The whole response is an abort command, up to case, spacing and a final
/// `.` or `!`.
fn is_abort_command(text: &str) -> bool {
    let command = text.trim().trim_end_matches(['.', '!']).to_lowercase();
    let mut parts = command.split_whitespace();
    let Some(verb) = parts.next() else {
        return false;
    };
    let object: Vec<&str> = parts.collect();
    ABORT_WORDS.contains(&verb) && ABORT_OBJECTS.contains(&object.as_slice())
}

fn is_bare_proceed(text: &str) -> bool {
    matches!(
        text.trim().trim_end_matches(['.', '!']).to_lowercase().as_str(),
        "proceed" | "continue" | "ok" | "okay" | "yes" | "go" | "go ahead" | "next"
    )
}
