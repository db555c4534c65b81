//! Pluggable LLM provider abstraction.
//!
//! A [`Provider`] turns a provider-agnostic [`InvokeRequest`] into one
//! structured-output response. The provider for a model is detected from
//! the model name (`gpt-*`, `o*`, `claude-*`, `gemini-*`, `vendor/model`),
//! credentials come from per-provider environment variables, and
//! capability filtering happens before any bytes hit the wire.

pub mod anthropic;
pub mod capability;
pub mod google;
pub mod openai;
pub mod openrouter;
pub mod types;

pub use capability::{ModelCapabilities, ModelFamily, capabilities, filter_parameters};
pub use types::{InvokeRequest, InvokeResponse, ModelParameters, ReasoningEffort};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::ProviderError;

/// Recognized provider backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    /// OpenAI platform.
    OpenAi,
    /// Anthropic platform.
    Anthropic,
    /// Google Gemini API.
    Google,
    /// OpenRouter (vendor-prefixed models).
    OpenRouter,
}

impl ProviderKind {
    /// Detects the provider for a model name, honoring an explicit
    /// override tag when given.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::UnknownModel`] when neither the override
    /// nor the model name resolves to a provider.
    pub fn detect(model: &str, override_tag: Option<&str>) -> Result<Self, ProviderError> {
        if let Some(tag) = override_tag {
            return Self::parse(tag).ok_or_else(|| ProviderError::UnknownModel {
                model: format!("{model} (override {tag:?})"),
            });
        }

        let lower = model.to_lowercase();
        if lower.starts_with("gpt-") || lower.starts_with("chatgpt-") || capability::is_o_series(&lower)
        {
            Ok(Self::OpenAi)
        } else if lower.starts_with("claude-") {
            Ok(Self::Anthropic)
        } else if lower.starts_with("gemini-") {
            Ok(Self::Google)
        } else if lower.contains('/') {
            Ok(Self::OpenRouter)
        } else {
            Err(ProviderError::UnknownModel {
                model: model.to_string(),
            })
        }
    }

    /// Parses an explicit provider tag.
    #[must_use]
    pub fn parse(tag: &str) -> Option<Self> {
        match tag.to_lowercase().as_str() {
            "openai" => Some(Self::OpenAi),
            "anthropic" => Some(Self::Anthropic),
            "google" | "gemini" => Some(Self::Google),
            "openrouter" => Some(Self::OpenRouter),
            _ => None,
        }
    }

    /// Stable lowercase tag used in journals and tracking records.
    #[must_use]
    pub const fn tag(self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
            Self::Google => "google",
            Self::OpenRouter => "openrouter",
        }
    }

    /// Environment variable holding this provider's API key.
    #[must_use]
    pub const fn env_var(self) -> &'static str {
        match self {
            Self::OpenAi => "OPENAI_API_KEY",
            Self::Anthropic => "ANTHROPIC_API_KEY",
            Self::Google => "GOOGLE_API_KEY",
            Self::OpenRouter => "OPENROUTER_API_KEY",
        }
    }

    /// Reads this provider's API key from the environment.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::AuthMissing`] when the variable is unset
    /// or blank.
    pub fn api_key(self) -> Result<String, ProviderError> {
        std::env::var(self.env_var())
            .ok()
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| ProviderError::AuthMissing {
                provider: self.tag().to_string(),
                env_var: self.env_var().to_string(),
            })
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}

/// Trait for LLM provider backends.
///
/// Implementations handle the transport layer for a specific provider
/// while presenting a uniform structured-output interface to the
/// pipeline.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Which backend this is.
    fn kind(&self) -> ProviderKind;

    /// Executes one structured-output request.
    ///
    /// # Errors
    ///
    /// Returns a [`ProviderError`] classifying the failure for the retry
    /// policy: transient errors are retried, everything else is final.
    async fn invoke(&self, request: &InvokeRequest) -> Result<InvokeResponse, ProviderError>;
}

/// Creates the provider serving `model`.
///
/// # Errors
///
/// Returns [`ProviderError::UnknownModel`] for unrecognized models and
/// [`ProviderError::AuthMissing`] when the matching credential is absent.
pub fn create_provider(
    model: &str,
    override_tag: Option<&str>,
    timeout: Duration,
) -> Result<Arc<dyn Provider>, ProviderError> {
    match ProviderKind::detect(model, override_tag)? {
        ProviderKind::OpenAi => Ok(Arc::new(openai::OpenAiProvider::from_env(timeout)?)),
        ProviderKind::Anthropic => Ok(Arc::new(anthropic::AnthropicProvider::from_env(timeout)?)),
        ProviderKind::Google => Ok(Arc::new(google::GoogleProvider::from_env(timeout)?)),
        ProviderKind::OpenRouter => {
            Ok(Arc::new(openrouter::OpenRouterProvider::from_env(timeout)?))
        }
    }
}

/// Parses provider output into the top-level structured object.
///
/// Tolerates a fenced code block around the JSON but nothing else: the
/// parsed value must be an object, otherwise the response is a
/// validation failure preserved verbatim for the journal.
pub(crate) fn parse_structured_object(raw: &str) -> Result<serde_json::Value, ProviderError> {
    let trimmed = raw.trim();
    let body = if trimmed.starts_with("```") {
        trimmed
            .trim_start_matches("```json")
            .trim_start_matches("```")
            .trim_end_matches("```")
            .trim()
    } else {
        trimmed
    };

    match serde_json::from_str::<serde_json::Value>(body) {
        Ok(value) if value.is_object() => Ok(value),
        Ok(value) => Err(ProviderError::Validation {
            message: format!("expected a top-level object, got {}", json_type_name(&value)),
            content: raw.to_string(),
        }),
        Err(e) => Err(ProviderError::Validation {
            message: format!("response is not valid JSON: {e}"),
            content: raw.to_string(),
        }),
    }
}

const fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}
