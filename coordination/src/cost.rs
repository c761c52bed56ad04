//! Pre-debate cost estimation.
//!
//! Prices are approximate USD per million tokens and only meant for an
//! order-of-magnitude estimate before a debate starts.

use serde::Serialize;

use crate::debate::state::Participant;

pub const DEFAULT_AVG_INPUT_TOKENS: u64 = 2000;
pub const DEFAULT_AVG_OUTPUT_TOKENS: u64 = 500;

/// USD per 1M tokens.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ModelPricing {
    pub input: f64,
    pub output: f64,
}

const fn price(input: f64, output: f64) -> ModelPricing {
    ModelPricing { input, output }
}

const PRICING: &[(&str, ModelPricing)] = &[
    // Anthropic
    ("claude-opus-4-20250514", price(15.0, 75.0)),
    ("claude-sonnet-4-20250514", price(3.0, 15.0)),
    ("claude-haiku-4-20250414", price(0.80, 4.0)),
    // OpenAI
    ("gpt-4o", price(2.50, 10.0)),
    ("gpt-4o-mini", price(0.15, 0.60)),
    ("gpt-4-turbo", price(10.0, 30.0)),
    ("o1", price(15.0, 60.0)),
    ("o3-mini", price(1.10, 4.40)),
    // Google
    ("gemini-2.0-flash", price(0.10, 0.40)),
    ("gemini-2.0-flash-lite", price(0.075, 0.30)),
    ("gemini-1.5-pro", price(1.25, 5.0)),
    ("gemini-1.5-flash", price(0.075, 0.30)),
    // xAI
    ("grok-3", price(3.0, 15.0)),
    ("grok-3-mini", price(0.30, 0.50)),
    ("grok-2", price(2.0, 10.0)),
];

/// Pricing for a model name, if known.
pub fn pricing(model: &str) -> Option<ModelPricing> {
    PRICING
        .iter()
        .find(|(name, _)| *name == model)
        .map(|(_, p)| *p)
}

/// Estimated USD cost of a token volume. Unknown models cost 0.
pub fn estimate_cost(model: &str, input_tokens: u64, output_tokens: u64) -> f64 {
    let Some(p) = pricing(model) else {
        return 0.0;
    };
    (input_tokens as f64 / 1_000_000.0) * p.input + (output_tokens as f64 / 1_000_000.0) * p.output
}

/// Worst-case estimate for one participant.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CostEstimate {
    pub participant: String,
    pub model: String,
    /// One turn per round.
    pub turns: u32,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub usd: f64,
    /// Whether the model was found in the pricing table.
    pub priced: bool,
}

/// Estimate a debate that runs all `max_rounds`, in speaking order.
pub fn estimate_debate_cost(
    participants: &[Participant],
    max_rounds: u32,
    avg_input_tokens: u64,
    avg_output_tokens: u64,
) -> Vec<CostEstimate> {
    participants
        .iter()
        .map(|p| {
            let turns = u64::from(max_rounds);
            let input_tokens = avg_input_tokens * turns;
            let output_tokens = avg_output_tokens * turns;
            CostEstimate {
                participant: p.display_name.clone(),
                model: p.model.clone(),
                turns: max_rounds,
                input_tokens,
                output_tokens,
                usd: estimate_cost(&p.model, input_tokens, output_tokens),
                priced: pricing(&p.model).is_some(),
            }
        })
        .collect()
}

pub fn total_cost(estimates: &[CostEstimate]) -> f64 {
    estimates.iter().map(|e| e.usd).sum()
}
