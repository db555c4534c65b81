//! Anthropic provider implementation over the Messages API.
//!
//! Claude has no native JSON-schema response format, so the schema is
//! wrapped as a single forced tool and the structured object is read back
//! from the tool call's input. Reasoning effort maps to an extended
//! thinking budget.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::types::{InvokeRequest, InvokeResponse};
use super::{Provider, ProviderKind, filter_parameters};
use crate::core::TokenUsage;
use crate::error::ProviderError;

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";

/// Tool name the schema is wrapped under.
const EXTRACTION_TOOL: &str = "record_extraction";

/// Anthropic structured-output provider.
pub struct AnthropicProvider {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
}

#[derive(Debug, Serialize)]
struct MessagesRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    tools: Vec<ToolDefinition>,
    tool_choice: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    thinking: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct Message {
    role: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
struct ToolDefinition {
    name: String,
    description: String,
    input_schema: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    usage: Usage,
    model: String,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "tool_use")]
    ToolUse {
        input: serde_json::Value,
    },
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "thinking")]
    Thinking {
        #[serde(default)]
        thinking: String,
    },
}

#[derive(Debug, Deserialize)]
struct Usage {
    input_tokens: u64,
    output_tokens: u64,
    #[serde(default)]
    cache_read_input_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(rename = "type", default)]
    kind: String,
    message: String,
}

impl AnthropicProvider {
    /// Creates a provider from `ANTHROPIC_API_KEY`.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::AuthMissing`] when the key is absent, or a
    /// transient error when the HTTP client cannot be built.
    pub fn from_env(timeout: Duration) -> Result<Self, ProviderError> {
        let api_key = ProviderKind::Anthropic.api_key()?;
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

    fn build_request(request: &InvokeRequest) -> MessagesRequest {
        let params = filter_parameters(&request.model, &request.params);
        let thinking = params.reasoning_effort.map(|effort| {
            json!({"type": "enabled", "budget_tokens": effort.budget_tokens()})
        });
        // Extended thinking requires default sampling
        let temperature = if thinking.is_some() { None } else { params.temperature };
        // The response cap must leave room for the thinking budget
        let max_tokens = params.max_output_tokens
            + params
                .reasoning_effort
                .map_or(0, super::types::ReasoningEffort::budget_tokens);

        MessagesRequest {
            model: request.model.clone(),
            max_tokens,
            messages: vec![Message {
                role: "user",
                content: request.prompt.clone(),
            }],
            temperature,
            top_p: if thinking.is_some() { None } else { params.top_p },
            tools: vec![ToolDefinition {
                name: EXTRACTION_TOOL.to_string(),
                description: format!(
                    "Record the structured records extracted from the text, conforming to the {} schema.",
                    request.schema_name
                ),
                input_schema: request.schema.clone(),
            }],
            tool_choice: json!({"type": "tool", "name": EXTRACTION_TOOL}),
            thinking,
        }
    }

    /// Serialized Messages API body for one request, shared with the
    /// batch backend.
    pub(crate) fn request_body(request: &InvokeRequest) -> serde_json::Value {
        serde_json::to_value(Self::build_request(request)).unwrap_or_default()
    }

    /// Parses a Messages API response value (batch results carry the same
    /// shape inline) into text, structured object, and usage.
    pub(crate) fn parse_message_value(
        value: &serde_json::Value,
    ) -> Result<(String, serde_json::Value, TokenUsage), ProviderError> {
        let parsed: MessagesResponse =
            serde_json::from_value(value.clone()).map_err(|e| ProviderError::Validation {
                message: format!("message body not deserializable: {e}"),
                content: value.to_string(),
            })?;
        let (text, structured) = Self::extract_structured(&parsed)?;
        Ok((
            text,
            structured,
            TokenUsage {
                input: parsed.usage.input_tokens,
                cached_input: parsed.usage.cache_read_input_tokens,
                output: parsed.usage.output_tokens,
                reasoning: 0,
            },
        ))
    }

    fn extract_structured(
        response: &MessagesResponse,
    ) -> Result<(String, serde_json::Value), ProviderError> {
        for block in &response.content {
            if let ContentBlock::ToolUse { input } = block {
                if input.is_object() {
                    let text = serde_json::to_string(input).unwrap_or_default();
                    return Ok((text, input.clone()));
                }
                return Err(ProviderError::Validation {
                    message: "tool input is not an object".to_string(),
                    content: serde_json::to_string(input).unwrap_or_default(),
                });
            }
        }

        let text: String = response
            .content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        Err(ProviderError::Validation {
            message: "no tool call in response".to_string(),
            content: text,
        })
    }
}

impl std::fmt::Debug for AnthropicProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnthropicProvider")
            .field("base_url", &self.base_url)
            .finish()
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Anthropic
    }

    async fn invoke(&self, request: &InvokeRequest) -> Result<InvokeResponse, ProviderError> {
        let body = Self::build_request(request);
        let response = self
            .http
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(ProviderError::from)?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(map_error_response(&request.model, status.as_u16(), &text));
        }

        let parsed: MessagesResponse =
            response.json().await.map_err(|e| ProviderError::Validation {
                message: format!("response body not deserializable: {e}"),
                content: String::new(),
            })?;

        let (output_text, value) = Self::extract_structured(&parsed)?;
        Ok(InvokeResponse {
            output_text,
            value,
            usage: TokenUsage {
                input: parsed.usage.input_tokens,
                cached_input: parsed.usage.cache_read_input_tokens,
                output: parsed.usage.output_tokens,
                reasoning: 0,
            },
            model: parsed.model,
        })
    }
}

/// Maps a non-success Messages API response onto the error taxonomy.
pub(crate) fn map_error_response(model: &str, status: u16, body: &str) -> ProviderError {
    let message = serde_json::from_str::<ErrorEnvelope>(body).map_or_else(
        |_| body.chars().take(500).collect::<String>(),
        |envelope| format!("{}: {}", envelope.error.kind, envelope.error.message),
    );

    match status {
        401 | 403 => ProviderError::AuthInvalid {
            provider: ProviderKind::Anthropic.tag().to_string(),
            message,
        },
        429 | 529 => ProviderError::Transient {
            message,
            status: Some(status),
        },
        s if s >= 500 => ProviderError::Transient {
            message,
            status: Some(status),
        },
        400 if message.to_lowercase().contains("schema")
            || message.to_lowercase().contains("input_schema") =>
        {
            ProviderError::SchemaUnsupported {
                model: model.to_string(),
                message,
            }
        }
        _ => ProviderError::Permanent {
            message,
            status: Some(status),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::types::{ModelParameters, ReasoningEffort};

    fn request_with(effort: Option<ReasoningEffort>) -> InvokeRequest {
        InvokeRequest {
            model: "claude-sonnet-4-5".to_string(),
            prompt: "extract".to_string(),
            schema_name: "entries".to_string(),
            schema: serde_json::json!({"type": "object"}),
            params: ModelParameters {
                temperature: Some(0.2),
                top_p: None,
                max_output_tokens: 4_096,
                reasoning_effort: effort,
            },
        }
    }

    #[test]
    fn test_build_request_wraps_schema_as_tool() {
        let built = AnthropicProvider::build_request(&request_with(None));
        assert_eq!(built.tools.len(), 1);
        assert_eq!(built.tools[0].name, EXTRACTION_TOOL);
        assert_eq!(built.tool_choice["type"], "tool");
        assert_eq!(built.temperature, Some(0.2));
        assert!(built.thinking.is_none());
        assert_eq!(built.max_tokens, 4_096);
    }

    #[test]
    fn test_build_request_thinking_budget() {
        let built = AnthropicProvider::build_request(&request_with(Some(ReasoningEffort::Medium)));
        let thinking = built.thinking.unwrap_or_default();
        assert_eq!(thinking["type"], "enabled");
        assert_eq!(thinking["budget_tokens"], 8_192);
        // Sampling params are dropped and the cap covers the budget
        assert!(built.temperature.is_none());
        assert_eq!(built.max_tokens, 4_096 + 8_192);
    }

    #[test]
    fn test_extract_structured_from_tool_use() {
        let response = MessagesResponse {
            content: vec![
                ContentBlock::Thinking {
                    thinking: "considering".to_string(),
                },
                ContentBlock::ToolUse {
                    input: serde_json::json!({"entries": [1]}),
                },
            ],
            usage: Usage {
                input_tokens: 10,
                output_tokens: 5,
                cache_read_input_tokens: 0,
            },
            model: "claude-sonnet-4-5".to_string(),
        };
        let (text, value) = AnthropicProvider::extract_structured(&response).unwrap();
        assert!(text.contains("entries"));
        assert_eq!(value["entries"][0], 1);
    }

    #[test]
    fn test_extract_structured_no_tool_call() {
        let response = MessagesResponse {
            content: vec![ContentBlock::Text {
                text: "I cannot do that".to_string(),
            }],
            usage: Usage {
                input_tokens: 1,
                output_tokens: 1,
                cache_read_input_tokens: 0,
            },
            model: "claude-sonnet-4-5".to_string(),
        };
        let err = AnthropicProvider::extract_structured(&response).unwrap_err();
        match err {
            ProviderError::Validation { content, .. } => {
                assert_eq!(content, "I cannot do that");
            }
            _ => unreachable!("expected validation error"),
        }
    }

    #[test]
    fn test_map_error_response_codes() {
        let overloaded = map_error_response(
            "claude-sonnet-4-5",
            529,
            r#"{"error": {"type": "overloaded_error", "message": "Overloaded"}}"#,
        );
        assert!(overloaded.is_retryable());

        let auth = map_error_response("claude-sonnet-4-5", 401, "{}");
        assert!(matches!(auth, ProviderError::AuthInvalid { .. }));

        let schema = map_error_response(
            "claude-sonnet-4-5",
            400,
            r#"{"error": {"type": "invalid_request_error", "message": "tools.0.input_schema: nesting too deep"}}"#,
        );
        assert!(matches!(schema, ProviderError::SchemaUnsupported { .. }));

        let permanent = map_error_response(
            "claude-sonnet-4-5",
            400,
            r#"{"error": {"type": "invalid_request_error", "message": "max_tokens too large"}}"#,
        );
        assert!(matches!(permanent, ProviderError::Permanent { .. }));
    }

}
