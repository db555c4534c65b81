//! Static per-model capability descriptors and parameter filtering.
//!
//! Capabilities are data, not behavior: each recognized model family maps
//! to a fixed descriptor that the dispatch path consults to drop
//! unsupported parameters and to decide whether batch mode is available.
//! Detection is pure and cheap, so no memoization is needed.

use super::ProviderKind;
use super::types::ModelParameters;
use crate::error::ProviderError;

/// Recognized model families.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFamily {
    /// OpenAI chat models without a deliberation phase.
    Gpt,
    /// OpenAI reasoning models (`o`-series and the gpt-5 generation).
    GptReasoning,
    /// Anthropic Claude models.
    Claude,
    /// Google Gemini models.
    Gemini,
    /// Any vendor-prefixed model routed through OpenRouter.
    Routed,
}

/// Static capability descriptor for one model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelCapabilities {
    /// Model family.
    pub family: ModelFamily,
    /// Provider serving this family.
    pub provider: ProviderKind,
    /// Whether the model has a controllable deliberation phase.
    pub supports_reasoning: bool,
    /// Whether `temperature` is accepted.
    pub supports_temperature: bool,
    /// Whether `top_p` is accepted.
    pub supports_top_p: bool,
    /// Whether native structured output (or forced tool use) is available.
    pub supports_structured_output: bool,
    /// Hard cap on response tokens.
    pub max_output_tokens: u32,
    /// Whether the provider offers an asynchronous batch API for it.
    pub batch_supported: bool,
}

/// Resolves the capability descriptor for a model.
///
/// # Errors
///
/// Returns [`ProviderError::UnknownModel`] when the name matches no
/// recognized family.
pub fn capabilities(model: &str) -> Result<ModelCapabilities, ProviderError> {
    let provider = ProviderKind::detect(model, None)?;
    let family = family_of(model, provider);

    Ok(match family {
        ModelFamily::Gpt => ModelCapabilities {
            family,
            provider,
            supports_reasoning: false,
            supports_temperature: true,
            supports_top_p: true,
            supports_structured_output: true,
            max_output_tokens: 16_384,
            batch_supported: true,
        },
        ModelFamily::GptReasoning => ModelCapabilities {
            family,
            provider,
            supports_reasoning: true,
            supports_temperature: false,
            supports_top_p: false,
            supports_structured_output: true,
            max_output_tokens: 65_536,
            batch_supported: true,
        },
        ModelFamily::Claude => ModelCapabilities {
            family,
            provider,
            supports_reasoning: true,
            supports_temperature: true,
            supports_top_p: true,
            supports_structured_output: true,
            max_output_tokens: 64_000,
            batch_supported: true,
        },
        ModelFamily::Gemini => ModelCapabilities {
            family,
            provider,
            supports_reasoning: true,
            supports_temperature: true,
            supports_top_p: true,
            supports_structured_output: true,
            max_output_tokens: 65_536,
            batch_supported: true,
        },
        ModelFamily::Routed => ModelCapabilities {
            family,
            provider,
            supports_reasoning: true,
            supports_temperature: true,
            supports_top_p: true,
            supports_structured_output: true,
            max_output_tokens: 32_768,
            batch_supported: false,
        },
    })
}

fn family_of(model: &str, provider: ProviderKind) -> ModelFamily {
    let lower = model.to_lowercase();
    match provider {
        ProviderKind::OpenAi => {
            if lower.starts_with("gpt-5") || is_o_series(&lower) {
                ModelFamily::GptReasoning
            } else {
                ModelFamily::Gpt
            }
        }
        ProviderKind::Anthropic => ModelFamily::Claude,
        ProviderKind::Google => ModelFamily::Gemini,
        ProviderKind::OpenRouter => ModelFamily::Routed,
    }
}

/// Matches the `o`-series reasoning models (`o1`, `o3-mini`, `o4-mini`, …).
pub(crate) fn is_o_series(lower: &str) -> bool {
    let mut chars = lower.chars();
    chars.next() == Some('o')
        && chars.next().is_some_and(|c| c.is_ascii_digit())
        && lower
            .chars()
            .nth(2)
            .is_none_or(|c| c == '-' || c.is_ascii_digit())
}

/// Drops requested parameters the model does not accept and clamps the
/// output cap to the model's maximum.
///
/// Unknown models pass parameters through unchanged; the provider will
/// report its own error.
#[must_use]
pub fn filter_parameters(model: &str, requested: &ModelParameters) -> ModelParameters {
    let Ok(caps) = capabilities(model) else {
        return *requested;
    };

    ModelParameters {
        temperature: requested.temperature.filter(|_| caps.supports_temperature),
        top_p: requested.top_p.filter(|_| caps.supports_top_p),
        max_output_tokens: requested.max_output_tokens.min(caps.max_output_tokens),
        reasoning_effort: requested.reasoning_effort.filter(|_| caps.supports_reasoning),
    }
}
