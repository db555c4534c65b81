//! OpenRouter provider implementation.
//!
//! OpenRouter exposes an OpenAI-compatible chat completions surface for
//! vendor-prefixed models (`deepseek/…`, `meta-llama/…`). The request is
//! built directly so router-specific fields can ride along: DeepSeek
//! models take a boolean reasoning toggle, everything else an effort
//! level.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};

use super::types::{InvokeRequest, InvokeResponse};
use super::{Provider, ProviderKind, filter_parameters, parse_structured_object};
use crate::core::TokenUsage;
use crate::error::ProviderError;

const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";

/// OpenRouter structured-output provider.
pub struct OpenRouterProvider {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

impl OpenRouterProvider {
    /// Creates a provider from `OPENROUTER_API_KEY`.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::AuthMissing`] when the key is absent, or a
    /// transient error when the HTTP client cannot be built.
    pub fn from_env(timeout: Duration) -> Result<Self, ProviderError> {
        let api_key = ProviderKind::OpenRouter.api_key()?;
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(ProviderError::from)?;
        Ok(Self {
            http,
            api_key,
            base_url: DEFAULT_BASE_URL.to_string(),
        })
    }

    /// Overrides the API base URL (tests and proxies).
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn build_body(request: &InvokeRequest) -> Value {
        let params = filter_parameters(&request.model, &request.params);
        let mut body = json!({
            "model": request.model,
            "messages": [{"role": "user", "content": request.prompt}],
            "max_tokens": params.max_output_tokens,
            "response_format": {
                "type": "json_schema",
                "json_schema": {
                    "name": request.schema_name,
                    "strict": true,
                    "schema": request.schema,
                }
            },
        });
        if let Some(t) = params.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(p) = params.top_p {
            body["top_p"] = json!(p);
        }
        if let Some(effort) = params.reasoning_effort {
            // DeepSeek models only understand an on/off toggle
            body["reasoning"] = if request.model.starts_with("deepseek/") {
                json!({"enabled": true})
            } else {
                json!({"effort": effort.as_str()})
            };
        }
        body
    }
}

impl std::fmt::Debug for OpenRouterProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenRouterProvider")
            .field("base_url", &self.base_url)
            .finish()
    }
}

#[async_trait]
impl Provider for OpenRouterProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenRouter
    }

    async fn invoke(&self, request: &InvokeRequest) -> Result<InvokeResponse, ProviderError> {
        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&Self::build_body(request))
            .send()
            .await
            .map_err(ProviderError::from)?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(map_error_response(&request.model, status.as_u16(), &text));
        }

        let parsed: ChatResponse =
            response.json().await.map_err(|e| ProviderError::Validation {
                message: format!("response body not deserializable: {e}"),
                content: String::new(),
            })?;

        let output_text = parsed
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default();
        let value = parse_structured_object(&output_text)?;

        let usage = parsed.usage.map_or_else(TokenUsage::default, |u| TokenUsage {
            input: u.prompt_tokens,
            cached_input: 0,
            output: u.completion_tokens,
            reasoning: 0,
        });

        Ok(InvokeResponse {
            output_text,
            value,
            usage,
            model: parsed.model.unwrap_or_else(|| request.model.clone()),
        })
    }
}

/// Maps a non-success chat completions response onto the error taxonomy.
fn map_error_response(model: &str, status: u16, body: &str) -> ProviderError {
    let message: String = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            v.pointer("/error/message")
                .and_then(Value::as_str)
                .map(ToString::to_string)
        })
        .unwrap_or_else(|| body.chars().take(500).collect());

    match status {
        401 | 403 => ProviderError::AuthInvalid {
            provider: ProviderKind::OpenRouter.tag().to_string(),
            message,
        },
        429 => ProviderError::Transient {
            message,
            status: Some(status),
        },
        s if s >= 500 => ProviderError::Transient {
            message,
            status: Some(status),
        },
        400 if message.to_lowercase().contains("schema") => ProviderError::SchemaUnsupported {
            model: model.to_string(),
            message,
        },
        _ => ProviderError::Permanent {
            message,
            status: Some(status),
        },
    }
}
