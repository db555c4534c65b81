//! Token usage accounting shared by providers, the journal, and the ledger.

use serde::{Deserialize, Serialize};

/// Token counts reported by a provider for one request.
///
/// Cached input and reasoning tokens are zero for providers that do not
/// report them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Prompt tokens billed as fresh input.
    pub input: u64,
    /// Prompt tokens served from the provider's cache.
    #[serde(default)]
    pub cached_input: u64,
    /// Completion tokens.
    pub output: u64,
    /// Reasoning tokens, for models that separate them from output.
    #[serde(default)]
    pub reasoning: u64,
}

impl TokenUsage {
    /// Total tokens that count against the daily ledger.
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.input + self.cached_input + self.output + self.reasoning
    }

    /// Accumulates another usage record into this one.
    pub const fn add(&mut self, other: &Self) {
        self.input += other.input;
        self.cached_input += other.cached_input;
        self.output += other.output;
        self.reasoning += other.reasoning;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_total() {
        let usage = TokenUsage {
            input: 100,
            cached_input: 20,
            output: 50,
            reasoning: 30,
        };
        assert_eq!(usage.total(), 200);
    }

    #[test]
    fn test_add_accumulates() {
        let mut sum = TokenUsage::default();
        sum.add(&TokenUsage {
            input: 10,
            cached_input: 0,
            output: 5,
            reasoning: 0,
        });
        sum.add(&TokenUsage {
            input: 1,
            cached_input: 2,
            output: 3,
            reasoning: 4,
        });
        assert_eq!(sum.input, 11);
        assert_eq!(sum.cached_input, 2);
        assert_eq!(sum.output, 8);
        assert_eq!(sum.reasoning, 4);
    }

    #[test]
    fn test_missing_fields_default_on_deserialize() {
        let usage: TokenUsage =
            serde_json::from_str(r#"{"input": 7, "output": 3}"#).unwrap_or_default();
        assert_eq!(usage.input, 7);
        assert_eq!(usage.cached_input, 0);
        assert_eq!(usage.reasoning, 0);
    }
}
