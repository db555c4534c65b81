//! Provider-agnostic request and response types.
//!
//! Adapters translate these into provider-specific wire formats. This
//! keeps the scheduler, refiner, and batch manager decoupled from any
//! particular LLM vendor.

use serde::{Deserialize, Serialize};

use crate::core::TokenUsage;

/// Reasoning effort hint, translated per provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningEffort {
    /// Minimal deliberation.
    Low,
    /// Balanced deliberation.
    Medium,
    /// Extensive deliberation.
    High,
}

impl ReasoningEffort {
    /// Parses an effort name (case-insensitive).
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            _ => None,
        }
    }

    /// Canonical lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }

    /// Thinking-budget tokens for providers that take a token budget
    /// instead of a level.
    #[must_use]
    pub const fn budget_tokens(self) -> u32 {
        match self {
            Self::Low => 2_048,
            Self::Medium => 8_192,
            Self::High => 16_384,
        }
    }
}

/// Requested sampling and output parameters.
///
/// These are the caller's wishes; [`crate::provider::filter_parameters`]
/// drops whatever the target model does not support before dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ModelParameters {
    /// Sampling temperature.
    pub temperature: Option<f32>,
    /// Nucleus sampling parameter.
    pub top_p: Option<f32>,
    /// Response token cap.
    pub max_output_tokens: u32,
    /// Reasoning effort for models that deliberate.
    pub reasoning_effort: Option<ReasoningEffort>,
}

/// One structured-output request.
#[derive(Debug, Clone)]
pub struct InvokeRequest {
    /// Target model name.
    pub model: String,
    /// Fully rendered prompt (context bundle already injected).
    pub prompt: String,
    /// Stable schema name, forwarded to the provider.
    pub schema_name: String,
    /// JSON Schema the response must conform to. Opaque to the pipeline.
    pub schema: serde_json::Value,
    /// Requested parameters, filtered per model capabilities at dispatch.
    pub params: ModelParameters,
}

/// A validated structured-output response.
#[derive(Debug, Clone)]
pub struct InvokeResponse {
    /// Raw response text exactly as the provider returned it.
    pub output_text: String,
    /// The parsed top-level object.
    pub value: serde_json::Value,
    /// Token usage reported by the provider.
    pub usage: TokenUsage,
    /// Model that actually served the request.
    pub model: String,
}
