//! Budgeted, XML-tagged stage input.
//!
//! [`ContextAssembler`] turns a stage's inputs into one prompt body. Fixed
//! sections (question, guidance, repair feedback) are always included. Prior
//! stage summaries and follow-up material are clipped to their share of the
//! budget. Evidence gets the remainder, split 60/30/10 across primary,
//! supporting and context roles; at least one primary item is always kept,
//! truncated if it does not fit.

use std::fmt::Write as _;

use crate::evidence::{Evidence, EvidenceRole};
use crate::follow_up::FollowUpContext;
use crate::tokens::{estimate_tokens, truncate_to_tokens};
use crate::{EvidenceId, TokenCount};

/// Per-item tag overhead, in tokens.
const ITEM_OVERHEAD: u64 = 50;

/// Share of the budget available to prior-stage summaries, in percent.
const PRIOR_SHARE: u64 = 15;

/// Share of the budget available to follow-up material, in percent.
const FOLLOW_UP_SHARE: u64 = 10;

/// One prior stage's contribution.
#[derive(Debug, Clone, PartialEq)]
pub struct PriorOutput<'a> {
    pub stage: &'a str,
    pub content: String,
}

/// Everything a stage may see.
#[derive(Debug, Clone, Default)]
pub struct ContextInput<'a> {
    pub question: &'a str,
    pub guidance: Option<&'a str>,
    pub prior: Vec<PriorOutput<'a>>,
    pub evidence: &'a [Evidence],
    pub follow_up: Option<&'a FollowUpContext>,
    pub repair_feedback: Option<&'a str>,
}

/// Assembled prompt body plus accounting.
#[derive(Debug, Clone, PartialEq)]
pub struct AssembledContext {
    pub text: String,
    pub tokens: TokenCount,
    pub included: Vec<EvidenceId>,
    pub excluded: usize,
}

/// Builds stage input under a token budget.
#[derive(Debug, Clone, Copy)]
pub struct ContextAssembler {
    budget: TokenCount,
}

impl ContextAssembler {
    pub fn new(budget: TokenCount) -> Self {
        Self { budget }
    }

    pub fn budget(&self) -> TokenCount {
        self.budget
    }

    pub fn assemble(&self, input: &ContextInput<'_>) -> AssembledContext {
        let mut out = String::new();
        push_tag(&mut out, "question", &[], input.question);
        if let Some(guidance) = input.guidance.filter(|g| !g.trim().is_empty()) {
            push_tag(&mut out, "guidance", &[], guidance);
        }
        if let Some(feedback) = input.repair_feedback.filter(|f| !f.trim().is_empty()) {
            push_tag(&mut out, "repair_feedback", &[], feedback);
        }
        let fixed = estimate_tokens(&out);
        let remaining = self.budget.saturating_sub(fixed);

        let prior_budget = share(self.budget, PRIOR_SHARE).min(remaining);
        let prior_used = self.push_prior(&mut out, &input.prior, prior_budget);
        let remaining = remaining.saturating_sub(prior_used);

        let follow_up_used = match input.follow_up {
            Some(ctx) => self.push_follow_up(&mut out, ctx, share(self.budget, FOLLOW_UP_SHARE).min(remaining)),
            None => TokenCount::new(0),
        };
        let remaining = remaining.saturating_sub(follow_up_used);

        let (included, excluded) = push_evidence(&mut out, input.evidence, remaining);
        let tokens = estimate_tokens(&out);
        tracing::debug!(
            budget = %self.budget,
            tokens = %tokens,
            included = included.len(),
            excluded,
            "stage context assembled"
        );
        AssembledContext {
            text: out,
            tokens,
            included,
            excluded,
        }
    }

    fn push_prior(&self, out: &mut String, prior: &[PriorOutput<'_>], budget: TokenCount) -> TokenCount {
        if prior.is_empty() {
            return TokenCount::new(0);
        }
        let per_stage = TokenCount::new((budget.as_u64() / prior.len() as u64).saturating_sub(ITEM_OVERHEAD / 2));
        let before = estimate_tokens(out);
        for p in prior {
            push_tag(out, "prior_stage", &[("name", p.stage)], truncate_to_tokens(&p.content, per_stage));
        }
        estimate_tokens(out).saturating_sub(before)
    }

    fn push_follow_up(&self, out: &mut String, ctx: &FollowUpContext, budget: TokenCount) -> TokenCount {
        let before = estimate_tokens(out);
        let number = ctx.follow_up_number.to_string();
        let previous = ctx.previous_session_id.to_string();
        let mut left = budget.saturating_sub(TokenCount::new(ITEM_OVERHEAD));
        let mut body = String::new();
        push_tag(&mut body, "previous_question", &[], truncate_to_tokens(&ctx.previous_question, left));
        left = left.saturating_sub(estimate_tokens(&body));

        // Excerpts are clipped before tagging so every tag is closed.
        let mut omitted = 0usize;
        for section in &ctx.sections {
            let room = left.saturating_sub(TokenCount::new(ITEM_OVERHEAD / 2));
            if room.is_zero() {
                omitted += 1;
                continue;
            }
            let mut tag = String::new();
            push_tag(
                &mut tag,
                "prior_section",
                &[("id", section.id.as_str()), ("heading", &section.heading)],
                truncate_to_tokens(&section.excerpt, room),
            );
            left = left.saturating_sub(estimate_tokens(&tag));
            body.push_str(&tag);
        }
        if omitted > 0 {
            let _ = writeln!(body, "<omitted_sections count=\"{omitted}\"/>");
        }
        let _ = writeln!(out, "<follow_up number=\"{number}\" previous_session=\"{previous}\">\n{body}</follow_up>");
        estimate_tokens(out).saturating_sub(before)
    }
}

fn share(budget: TokenCount, percent: u64) -> TokenCount {
    TokenCount::new(budget.as_u64() * percent / 100)
}

/// Appends evidence grouped by role; returns (included ids, excluded count).
fn push_evidence(out: &mut String, evidence: &[Evidence], budget: TokenCount) -> (Vec<EvidenceId>, usize) {
    if evidence.is_empty() {
        return (Vec::new(), 0);
    }
    let splits = [
        (EvidenceRole::Primary, 60),
        (EvidenceRole::Supporting, 30),
        (EvidenceRole::Context, 10),
    ];
    let mut included = Vec::new();
    let mut excluded = 0;
    let mut rank = 0usize;

    let _ = writeln!(out, "<evidence total=\"{}\">", evidence.len());
    for (role, percent) in splits {
        let group: Vec<&Evidence> = evidence.iter().filter(|e| e.role == role).collect();
        if group.is_empty() {
            continue;
        }
        let mut left = share(budget, percent).as_u64();
        let mut section = String::new();
        let mut kept = 0usize;
        for item in group {
            rank += 1;
            let cost = estimate_tokens(&item.content).as_u64() + ITEM_OVERHEAD;
            let content = if cost <= left {
                left -= cost;
                item.content.as_str()
            } else if kept == 0 && role == EvidenceRole::Primary {
                let room = TokenCount::new(left.saturating_sub(ITEM_OVERHEAD).max(ITEM_OVERHEAD));
                left = 0;
                truncate_to_tokens(&item.content, room)
            } else {
                excluded += 1;
                continue;
            };
            kept += 1;
            let rank_attr = rank.to_string();
            let score_attr = format!("{:.3}", item.score);
            push_tag(
                &mut section,
                "item",
                &[
                    ("id", item.id.as_str()),
                    ("ref", &item.reference),
                    ("rank", &rank_attr),
                    ("score", &score_attr),
                ],
                content,
            );
            included.push(item.id.clone());
        }
        if kept > 0 {
            let _ = write!(out, "<{} count=\"{kept}\">\n{section}</{}>\n", role.as_str(), role.as_str());
        }
    }
    if excluded > 0 {
        let _ = writeln!(out, "<excluded count=\"{excluded}\"/>");
    }
    out.push_str("</evidence>\n");
    (included, excluded)
}

fn push_tag(out: &mut String, tag: &str, attrs: &[(&str, &str)], body: &str) {
    let _ = write!(out, "<{tag}");
    for (name, value) in attrs {
        let _ = write!(out, " {name}=\"{}\"", escape(value));
    }
    let _ = writeln!(out, ">\n{}\n</{tag}>", escape(body.trim()));
}

/// Escapes XML special characters.
pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::follow_up::PriorSection;
    use crate::{SectionId, SessionId};

    fn item(id: &str, role: EvidenceRole, chars: usize) -> Evidence {
        Evidence {
            id: EvidenceId::new(id).unwrap(),
            reference: format!("ISA {id}"),
            content: "x".repeat(chars),
            score: 0.5,
            role,
            query: None,
        }
    }

    #[test]
    fn fixed_sections_are_tagged_and_escaped() {
        let ctx = ContextAssembler::new(TokenCount::new(1_000)).assemble(&ContextInput {
            question: "Is <materiality> & scoping covered?",
            guidance: Some("focus on groups"),
            repair_feedback: Some("fix ip_2"),
            ..ContextInput::default()
        });
        assert!(ctx.text.contains("<question>\nIs &lt;materiality&gt; &amp; scoping covered?\n</question>"));
        assert!(ctx.text.contains("<guidance>"));
        assert!(ctx.text.contains("<repair_feedback>"));
        assert!(!ctx.text.contains("<evidence"));
    }

    #[test]
    fn evidence_is_split_by_role_and_overflow_excluded() {
        let evidence = vec![
            item("p1", EvidenceRole::Primary, 400),
            item("p2", EvidenceRole::Primary, 400),
            item("s1", EvidenceRole::Supporting, 400),
            item("s2", EvidenceRole::Supporting, 4_000),
            item("c1", EvidenceRole::Context, 4_000),
        ];
        let ctx = ContextAssembler::new(TokenCount::new(1_000)).assemble(&ContextInput {
            question: "q",
            evidence: &evidence,
            ..ContextInput::default()
        });
        let ids: Vec<&str> = ctx.included.iter().map(EvidenceId::as_str).collect();
        assert_eq!(ids, ["p1", "p2", "s1"]);
        assert_eq!(ctx.excluded, 2);
        assert!(ctx.text.contains("<primary count=\"2\">"));
        assert!(ctx.text.contains("<excluded count=\"2\"/>"));
    }

    #[test]
    fn one_primary_item_always_survives() {
        let evidence = vec![item("p1", EvidenceRole::Primary, 40_000)];
        let ctx = ContextAssembler::new(TokenCount::new(500)).assemble(&ContextInput {
            question: "q",
            evidence: &evidence,
            ..ContextInput::default()
        });
        assert_eq!(ctx.included.len(), 1);
        assert!(ctx.text.len() < 40_000);
    }

    #[test]
    fn prior_outputs_are_clipped_to_their_share() {
        let long = "y".repeat(100_000);
        let ctx = ContextAssembler::new(TokenCount::new(2_000)).assemble(&ContextInput {
            question: "q",
            prior: vec![PriorOutput {
                stage: "analyze",
                content: long,
            }],
            ..ContextInput::default()
        });
        assert!(ctx.text.contains("<prior_stage name=\"analyze\">"));
        assert!(ctx.tokens <= TokenCount::new(400));
    }

    fn follow_up(sections: usize, excerpt_chars: usize) -> FollowUpContext {
        FollowUpContext {
            previous_session_id: SessionId::new_random(),
            follow_up_number: 1,
            previous_question: "What changed in ISA 600?".to_string(),
            answer: String::new(),
            sections: (1..=sections)
                .map(|n| PriorSection {
                    id: SectionId::new(format!("s{n}")).unwrap(),
                    heading: format!("Heading {n}"),
                    excerpt: "z".repeat(excerpt_chars),
                })
                .collect(),
            sub_queries: Vec::new(),
            seen_evidence: Default::default(),
        }
    }

    #[test]
    fn tight_follow_up_budget_still_closes_every_tag() {
        let ctx = follow_up(6, 600);
        let assembled = ContextAssembler::new(TokenCount::new(1_500)).assemble(&ContextInput {
            question: "q",
            follow_up: Some(&ctx),
            ..ContextInput::default()
        });
        let text = &assembled.text;
        let opened = text.matches("<prior_section ").count();
        assert!(opened >= 1);
        assert!(opened < 6);
        assert_eq!(opened, text.matches("</prior_section>").count());
        assert!(text.contains(&format!("<omitted_sections count=\"{}\"/>", 6 - opened)));
        assert!(text.trim_end().ends_with("</follow_up>"));
        assert!(text.contains("</previous_question>"));
    }

    #[test]
    fn roomy_follow_up_budget_keeps_every_section_whole() {
        let ctx = follow_up(2, 40);
        let assembled = ContextAssembler::new(TokenCount::new(20_000)).assemble(&ContextInput {
            question: "q",
            follow_up: Some(&ctx),
            ..ContextInput::default()
        });
        assert_eq!(assembled.text.matches("</prior_section>").count(), 2);
        assert!(assembled.text.contains(&"z".repeat(40)));
        assert!(!assembled.text.contains("<omitted_sections"));
    }
}
