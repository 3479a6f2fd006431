//! Published per-million-token prices for Anthropic models.

use pipeline::cost::ModelPricing;

/// Prices matched by model-name family, most specific first.
const TABLE: &[(&str, f64, f64)] = &[
    ("opus-4", 15.0, 75.0),
    ("sonnet-4", 3.0, 15.0),
    ("3-7-sonnet", 3.0, 15.0),
    ("3-5-sonnet", 3.0, 15.0),
    ("3-5-haiku", 0.8, 4.0),
    ("haiku-4", 1.0, 5.0),
    ("3-haiku", 0.25, 1.25),
];

/// Pricing for `model`, or `None` for an unknown model family.
pub fn pricing_for(model: &str) -> Option<ModelPricing> {
    let model = model.to_ascii_lowercase();
    TABLE
        .iter()
        .find(|(family, _, _)| model.contains(family))
        .map(|(_, input, output)| ModelPricing::new(*input, *output))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_families_resolve() {
        assert_eq!(pricing_for("claude-sonnet-4-20250514"), Some(ModelPricing::new(3.0, 15.0)));
        assert_eq!(pricing_for("claude-3-5-haiku-latest"), Some(ModelPricing::new(0.8, 4.0)));
        assert_eq!(pricing_for("Claude-Opus-4-1"), Some(ModelPricing::new(15.0, 75.0)));
        assert_eq!(pricing_for("gpt-4o"), None);
    }
}
