use std::fmt;

use crate::gemini::ModelCallResult;

/// Running token and cost totals.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost: f64,
}

impl Usage {
    pub fn add(&mut self, other: &Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cost += other.cost;
    }
}

impl From<&ModelCallResult> for Usage {
    fn from(result: &ModelCallResult) -> Self {
        Self {
            input_tokens: result.input_tokens,
            output_tokens: result.output_tokens,
            cost: result.cost,
        }
    }
}

impl fmt::Display for Usage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "input {}, output {}, cost ${:.6}",
            self.input_tokens, self.output_tokens, self.cost
        )
    }
}
