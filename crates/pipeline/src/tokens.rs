//! Token estimation and output-size ceilings.
//!
//! Estimation uses a conservative 4-characters-per-token approximation. The
//! per-call output ceiling is whatever the fixed context window leaves after
//! the prompt and a safety margin, clamped to the stage's requested budget.

use thiserror::Error;

use crate::TokenCount;

/// Approximate characters per token.
pub const CHARS_PER_TOKEN: usize = 4;

/// Fraction of the requested output budget at which a failed parse is
/// reported as likely truncated.
pub const TRUNCATION_THRESHOLD: f64 = 0.95;

/// The prompt leaves no room for a useful response.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("prompt of ~{prompt} tokens leaves {available} of {window} context tokens; at least {minimum} needed")]
pub struct BudgetError {
    /// Estimated prompt size.
    pub prompt: TokenCount,
    /// Tokens left for output.
    pub available: TokenCount,
    /// Context window.
    pub window: TokenCount,
    /// Smallest useful output.
    pub minimum: TokenCount,
}

/// Estimates token counts and computes safe output ceilings for one model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenBudgetEstimator {
    context_window: TokenCount,
    safety_margin: TokenCount,
    min_output: TokenCount,
    max_output: TokenCount,
}

impl Default for TokenBudgetEstimator {
    fn default() -> Self {
        Self::new(TokenCount::new(200_000), TokenCount::new(16_000))
    }
}

impl TokenBudgetEstimator {
    /// Creates an estimator for a model with `context_window` tokens that
    /// accepts at most `max_output` output tokens per call.
    pub fn new(context_window: TokenCount, max_output: TokenCount) -> Self {
        Self {
            context_window,
            safety_margin: TokenCount::new(1_024),
            min_output: TokenCount::new(256),
            max_output,
        }
    }

    /// Overrides the safety margin kept free between prompt and output.
    pub fn with_safety_margin(mut self, margin: TokenCount) -> Self {
        self.safety_margin = margin;
        self
    }

    /// Overrides the smallest output ceiling considered useful.
    pub fn with_min_output(mut self, min: TokenCount) -> Self {
        self.min_output = min;
        self
    }

    /// Context window size.
    pub fn context_window(&self) -> TokenCount {
        self.context_window
    }

    /// Estimated tokens for `text`, rounded up.
    pub fn estimate(&self, text: &str) -> TokenCount {
        estimate_tokens(text)
    }

    /// Output ceiling for a prompt of `prompt` tokens.
    ///
    /// `min(requested.unwrap_or(max_output), max_output, window - prompt - margin)`;
    /// fails if that is below the configured minimum.
    pub fn output_ceiling(&self, prompt: TokenCount, requested: Option<TokenCount>) -> Result<TokenCount, BudgetError> {
        let available = self
            .context_window
            .saturating_sub(prompt)
            .saturating_sub(self.safety_margin);
        let wanted = requested.unwrap_or(self.max_output).min(self.max_output);
        let ceiling = wanted.min(available);
        if ceiling < self.min_output {
            return Err(BudgetError {
                prompt,
                available,
                window: self.context_window,
                minimum: self.min_output,
            });
        }
        Ok(ceiling)
    }

    /// Tokens a prompt may use while still leaving `requested` output tokens.
    pub fn prompt_allowance(&self, requested: Option<TokenCount>) -> TokenCount {
        let output = requested.unwrap_or(self.max_output).min(self.max_output);
        self.context_window
            .saturating_sub(output)
            .saturating_sub(self.safety_margin)
    }
}

/// Estimated tokens for `text` (4 characters per token, rounded up).
pub fn estimate_tokens(text: &str) -> TokenCount {
    TokenCount::new(text.chars().count().div_ceil(CHARS_PER_TOKEN) as u64)
}

/// `true` when `used` reached [`TRUNCATION_THRESHOLD`] of `budget`.
pub fn likely_truncated(used: TokenCount, budget: TokenCount) -> bool {
    !budget.is_zero() && used.as_u64() as f64 >= budget.as_u64() as f64 * TRUNCATION_THRESHOLD
}

/// Longest prefix of `text` that fits in `tokens`, cut on a char boundary.
pub fn truncate_to_tokens(text: &str, tokens: TokenCount) -> &str {
    let max_chars = (tokens.as_u64() as usize).saturating_mul(CHARS_PER_TOKEN);
    match text.char_indices().nth(max_chars) {
        Some((byte, _)) => &text[..byte],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimates_round_up() {
        assert_eq!(estimate_tokens(""), TokenCount::new(0));
        assert_eq!(estimate_tokens("abc"), TokenCount::new(1));
        assert_eq!(estimate_tokens("abcde"), TokenCount::new(2));
        assert_eq!(estimate_tokens("äöüß"), TokenCount::new(1));
    }

    #[test]
    fn ceiling_is_clamped_by_request_and_window() {
        let est = TokenBudgetEstimator::new(TokenCount::new(10_000), TokenCount::new(4_000));
        assert_eq!(est.output_ceiling(TokenCount::new(1_000), None), Ok(TokenCount::new(4_000)));
        assert_eq!(
            est.output_ceiling(TokenCount::new(1_000), Some(TokenCount::new(2_000))),
            Ok(TokenCount::new(2_000))
        );
        assert_eq!(
            est.output_ceiling(TokenCount::new(7_000), None),
            Ok(TokenCount::new(10_000 - 7_000 - 1_024))
        );
    }

    #[test]
    fn ceiling_fails_when_prompt_fills_window() {
        let est = TokenBudgetEstimator::new(TokenCount::new(10_000), TokenCount::new(4_000));
        let err = est.output_ceiling(TokenCount::new(9_000), None).unwrap_err();
        assert_eq!(err.available, TokenCount::new(0));
    }

    #[test]
    fn truncation_threshold_is_95_percent() {
        assert!(likely_truncated(TokenCount::new(950), TokenCount::new(1_000)));
        assert!(!likely_truncated(TokenCount::new(949), TokenCount::new(1_000)));
        assert!(!likely_truncated(TokenCount::new(5), TokenCount::new(0)));
    }

    #[test]
    fn truncates_on_char_boundary() {
        assert_eq!(truncate_to_tokens("ééééééé", TokenCount::new(1)), "éééé");
        assert_eq!(truncate_to_tokens("short", TokenCount::new(10)), "short");
    }
}
