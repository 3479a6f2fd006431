//! Normalisation of stage output data into canonical views.
//!
//! Different code paths legitimately produce structurally different payloads
//! for the same logical stage (a model answering in the sectioned format, a
//! tool result stored verbatim, a skipped stage's pass-through marker). Each
//! [`OutputKind`] has one normaliser that tries every known shape in a fixed
//! priority order and returns [`StageView::Unrecognized`] when none matches.
//! Consumers match on [`StageView`]; nobody reads raw fields.
//!
//! Priority, for every kind: pass-through marker, nothing-to-do marker, the
//! canonical shape, the alternate shape(s), a bare `summary`. A payload that
//! carries two shapes at once is read as the earlier one.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::evidence::{Citation, Evidence};
use crate::stage::OutputKind;
use crate::{Diagnostic, DiagnosticSeverity, EvidenceId, VerificationScore};

/// Which shape a payload was recognised as. Recorded in `pause_formatted`
/// events for audit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NormalizationPath {
    PassThrough,
    NothingToDo,
    AnalysisSubQueries,
    AnalysisQueryList,
    CalibrationResults,
    CalibrationByQuery,
    EvidenceItems,
    EvidenceSearchResults,
    AnswerMarkdown,
    AnswerSections,
    VerificationOutcome,
    VerificationDetails,
    Document,
    Summary,
    Unrecognized,
}

// ---------------------------------------------------------------------------
// Views
// ---------------------------------------------------------------------------

/// One decomposed sub-query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubQuery {
    pub query: String,
    #[serde(default)]
    pub rationale: Option<String>,
}

/// Question decomposition.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AnalysisView {
    pub summary: Option<String>,
    pub sub_queries: Vec<SubQuery>,
}

/// One web search hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebHit {
    #[serde(default)]
    pub title: String,
    pub url: String,
    #[serde(default, alias = "description")]
    pub snippet: String,
    #[serde(default)]
    pub query: Option<String>,
}

/// Web calibration results.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CalibrationView {
    pub hits: Vec<WebHit>,
    pub hints: Vec<String>,
    pub warnings: Vec<String>,
}

/// Retrieved evidence after deduplication.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EvidenceView {
    pub items: Vec<Evidence>,
    pub dropped_seen: usize,
    pub dropped_duplicates: usize,
}

/// One headed section of an answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerSection {
    #[serde(default)]
    pub heading: String,
    #[serde(default)]
    pub body: String,
}

/// A synthesised answer.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AnswerView {
    pub text: String,
    pub sections: Vec<AnswerSection>,
    pub citations: Vec<Citation>,
}

/// A verification outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct VerificationView {
    pub needs_repair: bool,
    pub score: VerificationScore,
    pub issues: Vec<Diagnostic>,
    pub repair_instructions: Option<String>,
}

/// The rendered final document plus its compact answer fields.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DocumentView {
    #[serde(rename = "document")]
    pub markdown: String,
    #[serde(default)]
    pub answer: String,
    #[serde(default)]
    pub citations: Vec<Citation>,
    #[serde(default)]
    pub sub_queries: Vec<String>,
    #[serde(default)]
    pub evidence_ids: Vec<EvidenceId>,
    #[serde(default)]
    pub open_issues: Vec<String>,
}

/// Canonical view of any stage's data.
#[derive(Debug, Clone, PartialEq)]
pub enum StageView {
    Analysis(AnalysisView),
    Calibration(CalibrationView),
    Evidence(EvidenceView),
    Answer(AnswerView),
    Verification(VerificationView),
    Document(DocumentView),
    PassThrough { reason: String },
    NothingToDo { reason: String },
    Summary { text: String },
    /// No known shape matched.
    Unrecognized,
}

/// A view plus the path that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct Normalized {
    pub view: StageView,
    pub path: NormalizationPath,
}

impl Normalized {
    fn new(view: StageView, path: NormalizationPath) -> Self {
        Self { view, path }
    }

    /// The sentinel for total failure.
    pub fn unrecognized() -> Self {
        Self::new(StageView::Unrecognized, NormalizationPath::Unrecognized)
    }

    /// `true` for the sentinel.
    pub fn is_unrecognized(&self) -> bool {
        matches!(self.view, StageView::Unrecognized)
    }
}

// ---------------------------------------------------------------------------
// Normalisers
// ---------------------------------------------------------------------------

/// Normalises `data` produced by a stage of `kind`.
pub fn normalize(kind: OutputKind, data: &Value) -> Normalized {
    if let Some(marker) = markers(data) {
        return marker;
    }
    let specific = match kind {
        OutputKind::Analysis => analysis(data),
        OutputKind::Calibration => calibration(data),
        OutputKind::Evidence => evidence(data),
        OutputKind::Answer => answer(data),
        OutputKind::Verification => verification(data),
        OutputKind::Document => document(data),
        OutputKind::Generic => None,
    };
    specific.or_else(|| summary(data)).unwrap_or_else(Normalized::unrecognized)
}

fn str_field<'a>(data: &'a Value, field: &str) -> Option<&'a str> {
    data.get(field).and_then(Value::as_str).map(str::trim).filter(|s| !s.is_empty())
}

fn strings(data: &Value, field: &str) -> Vec<String> {
    data.get(field)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn typed<T: serde::de::DeserializeOwned>(data: &Value, field: &str) -> Option<T> {
    data.get(field).and_then(|v| serde_json::from_value(v.clone()).ok())
}

fn markers(data: &Value) -> Option<Normalized> {
    if data.get("skipped").and_then(Value::as_bool) == Some(true) {
        let reason = str_field(data, "reason").unwrap_or("skipped").to_string();
        return Some(Normalized::new(StageView::PassThrough { reason }, NormalizationPath::PassThrough));
    }
    if str_field(data, "status") == Some("nothing_to_do") {
        let reason = str_field(data, "reason").unwrap_or("no inputs").to_string();
        return Some(Normalized::new(StageView::NothingToDo { reason }, NormalizationPath::NothingToDo));
    }
    None
}

fn summary(data: &Value) -> Option<Normalized> {
    str_field(data, "summary").map(|text| {
        Normalized::new(StageView::Summary { text: text.to_string() }, NormalizationPath::Summary)
    })
}

fn analysis(data: &Value) -> Option<Normalized> {
    let summary = str_field(data, "summary").map(str::to_string);
    if let Some(sub_queries) = typed::<Vec<SubQuery>>(data, "sub_queries") {
        let sub_queries = sub_queries.into_iter().filter(|q| !q.query.trim().is_empty()).collect();
        return Some(Normalized::new(
            StageView::Analysis(AnalysisView { summary, sub_queries }),
            NormalizationPath::AnalysisSubQueries,
        ));
    }
    if data.get("queries").is_some_and(Value::is_array) {
        let sub_queries = strings(data, "queries")
            .into_iter()
            .map(|query| SubQuery { query, rationale: None })
            .collect();
        return Some(Normalized::new(
            StageView::Analysis(AnalysisView { summary, sub_queries }),
            NormalizationPath::AnalysisQueryList,
        ));
    }
    None
}

fn calibration(data: &Value) -> Option<Normalized> {
    let hints = strings(data, "analysis_hints");
    let warnings = strings(data, "warnings");
    if let Some(hits) = typed::<Vec<WebHit>>(data, "results") {
        return Some(Normalized::new(
            StageView::Calibration(CalibrationView { hits, hints, warnings }),
            NormalizationPath::CalibrationResults,
        ));
    }
    if let Some(by_query) = data.get("web_results").and_then(Value::as_object) {
        let mut hits = Vec::new();
        for (query, items) in by_query {
            let Ok(items) = serde_json::from_value::<Vec<WebHit>>(items.clone()) else {
                return None;
            };
            hits.extend(items.into_iter().map(|mut hit| {
                hit.query.get_or_insert_with(|| query.clone());
                hit
            }));
        }
        return Some(Normalized::new(
            StageView::Calibration(CalibrationView { hits, hints, warnings }),
            NormalizationPath::CalibrationByQuery,
        ));
    }
    None
}

fn evidence(data: &Value) -> Option<Normalized> {
    let count = |field: &str| data.get(field).and_then(Value::as_u64).unwrap_or(0) as usize;
    if let Some(items) = typed::<Vec<Evidence>>(data, "evidence") {
        return Some(Normalized::new(
            StageView::Evidence(EvidenceView {
                items,
                dropped_seen: count("dropped_seen"),
                dropped_duplicates: count("dropped_duplicates"),
            }),
            NormalizationPath::EvidenceItems,
        ));
    }
    if let Some(items) = typed::<Vec<Evidence>>(data, "results") {
        return Some(Normalized::new(
            StageView::Evidence(EvidenceView {
                items,
                ..EvidenceView::default()
            }),
            NormalizationPath::EvidenceSearchResults,
        ));
    }
    None
}

fn answer(data: &Value) -> Option<Normalized> {
    let citations = typed::<Vec<Citation>>(data, "citations").unwrap_or_default();
    if let Some(text) = str_field(data, "answer") {
        return Some(Normalized::new(
            StageView::Answer(AnswerView {
                text: text.to_string(),
                sections: split_sections(text),
                citations,
            }),
            NormalizationPath::AnswerMarkdown,
        ));
    }
    if let Some(sections) = typed::<Vec<AnswerSection>>(data, "sections") {
        let text = join_sections(&sections);
        return Some(Normalized::new(
            StageView::Answer(AnswerView { text, sections, citations }),
            NormalizationPath::AnswerSections,
        ));
    }
    None
}

/// Verification outcome as stored by the verification stage.
#[derive(Debug, Deserialize)]
struct OutcomeShape {
    needs_repair: bool,
    #[serde(default)]
    score: Option<f64>,
    #[serde(default)]
    issues: Vec<Diagnostic>,
    #[serde(default)]
    repair_instructions: Option<String>,
}

/// One per-citation detail as returned by the citation verification tool.
#[derive(Debug, Clone, Deserialize)]
pub struct CitationCheck {
    #[serde(default, alias = "paragraph_id")]
    pub evidence_id: String,
    #[serde(default)]
    pub claim: String,
    #[serde(default = "yes")]
    pub exists: bool,
    #[serde(default)]
    pub supports_claim: bool,
    #[serde(default)]
    pub reason: Option<String>,
}

fn yes() -> bool {
    true
}

/// The citation verification tool's response.
#[derive(Debug, Clone, Deserialize)]
pub struct CitationReport {
    pub passed: bool,
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub details: Vec<CitationCheck>,
}

impl VerificationView {
    /// Converts a tool report into the canonical outcome.
    ///
    /// Missing sources are blocking; unsupported claims are warnings. Repair
    /// instructions list every failed citation so the next synthesis round
    /// can address them.
    pub fn from_report(report: &CitationReport) -> Self {
        let issues: Vec<Diagnostic> = report
            .details
            .iter()
            .filter(|c| !c.exists || !c.supports_claim)
            .map(|c| {
                let (severity, category, message) = if !c.exists {
                    (
                        DiagnosticSeverity::Blocking,
                        "missing_source",
                        format!("cited source {} does not exist", c.evidence_id),
                    )
                } else {
                    (
                        DiagnosticSeverity::Warning,
                        "unsupported_claim",
                        format!("source {} does not support: \"{}\"", c.evidence_id, c.claim),
                    )
                };
                let message = match &c.reason {
                    Some(reason) if !reason.is_empty() => format!("{message} ({reason})"),
                    _ => message,
                };
                Diagnostic {
                    evidence: EvidenceId::new(c.evidence_id.clone()),
                    severity,
                    category: category.to_string(),
                    message,
                }
            })
            .collect();
        let needs_repair = !report.passed || issues.iter().any(|i| i.severity == DiagnosticSeverity::Blocking);
        let repair_instructions = needs_repair.then(|| {
            let mut lines = vec!["Revise the answer so every citation is supported by its source:".to_string()];
            lines.extend(issues.iter().map(|i| format!("- {}", i.message)));
            lines.push("Remove claims that no retrieved evidence supports.".to_string());
            lines.join("\n")
        });
        let score = report
            .score
            .and_then(VerificationScore::new)
            .unwrap_or_else(|| if report.passed { VerificationScore::perfect() } else { VerificationScore::zero() });
        Self {
            needs_repair,
            score,
            issues,
            repair_instructions,
        }
    }

    /// Canonical JSON form stored as the verification stage's data.
    pub fn to_value(&self) -> Value {
        serde_json::json!({
            "needs_repair": self.needs_repair,
            "score": self.score.as_f64(),
            "issues": self.issues,
            "repair_instructions": self.repair_instructions,
        })
    }
}

fn verification(data: &Value) -> Option<Normalized> {
    if data.get("needs_repair").is_some_and(Value::is_boolean) {
        let shape: OutcomeShape = serde_json::from_value(data.clone()).ok()?;
        let score = shape
            .score
            .and_then(VerificationScore::new)
            .unwrap_or_else(VerificationScore::perfect);
        return Some(Normalized::new(
            StageView::Verification(VerificationView {
                needs_repair: shape.needs_repair,
                score,
                issues: shape.issues,
                repair_instructions: shape.repair_instructions,
            }),
            NormalizationPath::VerificationOutcome,
        ));
    }
    if data.get("passed").is_some_and(Value::is_boolean) {
        let report: CitationReport = serde_json::from_value(data.clone()).ok()?;
        return Some(Normalized::new(
            StageView::Verification(VerificationView::from_report(&report)),
            NormalizationPath::VerificationDetails,
        ));
    }
    None
}

fn document(data: &Value) -> Option<Normalized> {
    str_field(data, "document")?;
    let view: DocumentView = serde_json::from_value(data.clone()).ok()?;
    Some(Normalized::new(StageView::Document(view), NormalizationPath::Document))
}

// ---------------------------------------------------------------------------
// Markdown sections
// ---------------------------------------------------------------------------

/// Splits Markdown into sections at ATX headings (`#` to `######`).
///
/// Text before the first heading becomes a section with an empty heading.
pub fn split_sections(markdown: &str) -> Vec<AnswerSection> {
    let mut sections = Vec::new();
    let mut heading = String::new();
    let mut body: Vec<&str> = Vec::new();
    let mut in_fence = false;

    for line in markdown.lines() {
        if line.trim_start().starts_with("```") {
            in_fence = !in_fence;
        }
        let trimmed = line.trim_start();
        let level = trimmed.chars().take_while(|c| *c == '#').count();
        let is_heading = !in_fence && (1..=6).contains(&level) && trimmed[level..].starts_with(' ');
        if is_heading {
            push_section(&mut sections, &heading, &body);
            heading = trimmed[level..].trim().to_string();
            body.clear();
        } else {
            body.push(line);
        }
    }
    push_section(&mut sections, &heading, &body);
    sections
}

fn push_section(sections: &mut Vec<AnswerSection>, heading: &str, body: &[&str]) {
    let body = body.join("\n").trim().to_string();
    if heading.is_empty() && body.is_empty() {
        return;
    }
    sections.push(AnswerSection {
        heading: heading.to_string(),
        body,
    });
}

/// Joins sections back into Markdown with `##` headings.
pub fn join_sections(sections: &[AnswerSection]) -> String {
    sections
        .iter()
        .map(|s| {
            if s.heading.is_empty() {
                s.body.clone()
            } else {
                format!("## {}\n\n{}", s.heading, s.body)
            }
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}
