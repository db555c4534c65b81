//! Google Gemini provider implementation over the `generateContent` API.
//!
//! Gemini supports a native response schema but rejects deeply nested
//! ones; nesting is checked before submission so the failure is
//! classified as unsupported-schema rather than a generic 400. Reasoning
//! effort maps to a thinking level.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};

use super::types::{InvokeRequest, InvokeResponse, ReasoningEffort};
use super::{Provider, ProviderKind, filter_parameters, parse_structured_object};
use crate::core::TokenUsage;
use crate::error::ProviderError;

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

/// Deepest property/item nesting the API accepts in a response schema.
const MAX_SCHEMA_DEPTH: usize = 6;

/// Google Gemini structured-output provider.
pub struct GoogleProvider {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(rename = "usageMetadata", default)]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<Content>,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct UsageMetadata {
    #[serde(rename = "promptTokenCount", default)]
    prompt_tokens: u64,
    #[serde(rename = "candidatesTokenCount", default)]
    candidate_tokens: u64,
    #[serde(rename = "cachedContentTokenCount", default)]
    cached_tokens: u64,
    #[serde(rename = "thoughtsTokenCount", default)]
    thought_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
}

impl GoogleProvider {
    /// Creates a provider from `GOOGLE_API_KEY`.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::AuthMissing`] when the key is absent, or a
    /// transient error when the HTTP client cannot be built.
    pub fn from_env(timeout: Duration) -> Result<Self, ProviderError> {
        let api_key = ProviderKind::Google.api_key()?;
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

    pub(crate) fn build_body(request: &InvokeRequest) -> Value {
        let params = filter_parameters(&request.model, &request.params);
        let mut generation_config = json!({
            "maxOutputTokens": params.max_output_tokens,
            "responseMimeType": "application/json",
            "responseSchema": request.schema,
        });
        if let Some(t) = params.temperature {
            generation_config["temperature"] = json!(t);
        }
        if let Some(p) = params.top_p {
            generation_config["topP"] = json!(p);
        }
        if let Some(effort) = params.reasoning_effort {
            generation_config["thinkingConfig"] = json!({
                "thinkingLevel": match effort {
                    ReasoningEffort::Low => "LOW",
                    ReasoningEffort::Medium => "MEDIUM",
                    ReasoningEffort::High => "HIGH",
                }
            });
        }

        json!({
            "contents": [{"role": "user", "parts": [{"text": request.prompt}]}],
            "generationConfig": generation_config,
        })
    }
}

impl std::fmt::Debug for GoogleProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GoogleProvider")
            .field("base_url", &self.base_url)
            .finish()
    }
}

#[async_trait]
impl Provider for GoogleProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Google
    }

    async fn invoke(&self, request: &InvokeRequest) -> Result<InvokeResponse, ProviderError> {
        let depth = schema_nesting_depth(&request.schema);
        if depth > MAX_SCHEMA_DEPTH {
            return Err(ProviderError::SchemaUnsupported {
                model: request.model.clone(),
                message: format!(
                    "schema nests {depth} levels deep (limit {MAX_SCHEMA_DEPTH})"
                ),
            });
        }

        let url = format!(
            "{}/v1beta/models/{}:generateContent",
            self.base_url, request.model
        );
        let response = self
            .http
            .post(url)
            .header("x-goog-api-key", &self.api_key)
            .json(&Self::build_body(request))
            .send()
            .await
            .map_err(ProviderError::from)?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(map_error_response(&request.model, status.as_u16(), &text));
        }

        let body: Value = response.json().await.map_err(|e| ProviderError::Validation {
            message: format!("response body not deserializable: {e}"),
            content: String::new(),
        })?;
        let model = body
            .get("modelVersion")
            .and_then(Value::as_str)
            .unwrap_or(&request.model)
            .to_string();
        let (output_text, value, usage) = parse_generate_value(&body)?;

        Ok(InvokeResponse {
            output_text,
            value,
            usage,
            model,
        })
    }
}

/// Parses a `generateContent` response value (batch results carry the
/// same shape inline) into text, structured object, and usage.
pub(crate) fn parse_generate_value(
    value: &Value,
) -> Result<(String, Value, TokenUsage), ProviderError> {
    let parsed: GenerateResponse =
        serde_json::from_value(value.clone()).map_err(|e| ProviderError::Validation {
            message: format!("response body not deserializable: {e}"),
            content: value.to_string(),
        })?;

    let output_text: String = parsed
        .candidates
        .first()
        .and_then(|c| c.content.as_ref())
        .map(|content| {
            content
                .parts
                .iter()
                .filter_map(|p| p.text.as_deref())
                .collect()
        })
        .unwrap_or_default();

    let structured = parse_structured_object(&output_text)?;
    let usage = parsed.usage_metadata.unwrap_or_default();
    Ok((
        output_text,
        structured,
        TokenUsage {
            input: usage.prompt_tokens.saturating_sub(usage.cached_tokens),
            cached_input: usage.cached_tokens,
            output: usage.candidate_tokens,
            reasoning: usage.thought_tokens,
        },
    ))
}

/// Measures how deeply a JSON schema nests through `properties` and
/// `items`.
pub(crate) fn schema_nesting_depth(schema: &Value) -> usize {
    fn sub_schemas(schema: &Value) -> Vec<&Value> {
        let mut subs = Vec::new();
        if let Some(props) = schema.get("properties").and_then(Value::as_object) {
            subs.extend(props.values());
        }
        if let Some(items) = schema.get("items") {
            subs.push(items);
        }
        subs
    }

    let subs = sub_schemas(schema);
    1 + subs.iter().map(|s| schema_nesting_depth(s)).max().unwrap_or(0)
}

/// Maps a non-success `generateContent` response onto the error taxonomy.
fn map_error_response(model: &str, status: u16, body: &str) -> ProviderError {
    let message = serde_json::from_str::<ErrorEnvelope>(body).map_or_else(
        |_| body.chars().take(500).collect::<String>(),
        |envelope| envelope.error.message,
    );

    match status {
        401 | 403 => ProviderError::AuthInvalid {
            provider: ProviderKind::Google.tag().to_string(),
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
