//! Static per-model pricing, in USD per one million tokens.

pub const TOKENS_PER_MILLION: f64 = 1_000_000.0;

/// Prompts above this many tokens are billed at the higher tier on models
/// that have one.
pub const LONG_PROMPT_THRESHOLD: u64 = 200_000;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelPrices {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

impl ModelPrices {
    pub const ZERO: Self = Self::new(0.0, 0.0);

    const fn new(input_per_million: f64, output_per_million: f64) -> Self {
        Self {
            input_per_million,
            output_per_million,
        }
    }

    pub fn cost(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        (input_tokens as f64 / TOKENS_PER_MILLION) * self.input_per_million
            + (output_tokens as f64 / TOKENS_PER_MILLION) * self.output_per_million
    }
}

/// Looks up the prices for `model`; `input_tokens` selects the tier.
pub fn prices_for(model: &str, input_tokens: u64) -> Option<ModelPrices> {
    let long_prompt = input_tokens > LONG_PROMPT_THRESHOLD;
    let prices = match model {
        // Older pro names are billed like 2.5 pro.
        "gemini-2.5-pro" | "gemini-1.5-pro" | "gemini-pro" => {
            if long_prompt {
                ModelPrices::new(2.50, 15.00)
            } else {
                ModelPrices::new(1.25, 10.00)
            }
        }
        "gemini-3-pro-preview" => {
            if long_prompt {
                ModelPrices::new(4.00, 18.00)
            } else {
                ModelPrices::new(2.00, 12.00)
            }
        }
        "gemini-2.5-flash" => ModelPrices::new(0.30, 2.50),
        "gemini-2.5-flash-lite" => ModelPrices::new(0.10, 0.40),
        _ => return None,
    };
    Some(prices)
}
