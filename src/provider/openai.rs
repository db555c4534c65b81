//! `OpenAI` provider implementation using the `async-openai` crate.
//!
//! Structured output uses the native JSON-schema response format; usage is
//! mapped into the pipeline's accounting including cached-prompt and
//! reasoning tokens.

use std::time::Duration;

use async_openai::Client;
use async_openai::config::OpenAIConfig;
use async_openai::error::OpenAIError;
use async_openai::types::{
    ChatCompletionRequestMessage, ChatCompletionRequestUserMessage,
    ChatCompletionRequestUserMessageContent, CompletionUsage, CreateChatCompletionRequest,
    ReasoningEffort as OpenAiReasoningEffort, ResponseFormat, ResponseFormatJsonSchema,
};
use async_trait::async_trait;

use super::types::{InvokeRequest, InvokeResponse, ReasoningEffort};
use super::{Provider, ProviderKind, filter_parameters, parse_structured_object};
use crate::core::TokenUsage;
use crate::error::ProviderError;

/// `OpenAI` structured-output provider.
pub struct OpenAiProvider {
    client: Client<OpenAIConfig>,
    timeout: Duration,
}

impl OpenAiProvider {
    /// Creates a provider from `OPENAI_API_KEY`.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::AuthMissing`] when the key is absent.
    pub fn from_env(timeout: Duration) -> Result<Self, ProviderError> {
        let api_key = ProviderKind::OpenAi.api_key()?;
        let config = OpenAIConfig::new().with_api_key(api_key);
        Ok(Self {
            client: Client::with_config(config),
            timeout,
        })
    }

    /// Builds the chat completion request for one chunk. Shared with the
    /// batch backend, which serializes it into batch input lines.
    pub(crate) fn build_request(request: &InvokeRequest) -> CreateChatCompletionRequest {
        let params = filter_parameters(&request.model, &request.params);

        let messages = vec![ChatCompletionRequestMessage::User(
            ChatCompletionRequestUserMessage {
                content: ChatCompletionRequestUserMessageContent::Text(request.prompt.clone()),
                name: None,
            },
        )];

        let response_format = ResponseFormat::JsonSchema {
            json_schema: ResponseFormatJsonSchema {
                description: None,
                name: request.schema_name.clone(),
                schema: Some(request.schema.clone()),
                strict: Some(true),
            },
        };

        CreateChatCompletionRequest {
            model: request.model.clone(),
            messages,
            temperature: params.temperature,
            top_p: params.top_p,
            max_completion_tokens: Some(params.max_output_tokens),
            response_format: Some(response_format),
            reasoning_effort: params.reasoning_effort.map(|effort| match effort {
                ReasoningEffort::Low => OpenAiReasoningEffort::Low,
                ReasoningEffort::Medium => OpenAiReasoningEffort::Medium,
                ReasoningEffort::High => OpenAiReasoningEffort::High,
            }),
            ..Default::default()
        }
    }

    fn map_usage(usage: Option<&CompletionUsage>) -> TokenUsage {
        usage.map_or_else(TokenUsage::default, |u| {
            let cached = u
                .prompt_tokens_details
                .as_ref()
                .and_then(|d| d.cached_tokens)
                .unwrap_or(0);
            let reasoning = u
                .completion_tokens_details
                .as_ref()
                .and_then(|d| d.reasoning_tokens)
                .unwrap_or(0);
            TokenUsage {
                input: u64::from(u.prompt_tokens.saturating_sub(cached)),
                cached_input: u64::from(cached),
                output: u64::from(u.completion_tokens.saturating_sub(reasoning)),
                reasoning: u64::from(reasoning),
            }
        })
    }
}

impl std::fmt::Debug for OpenAiProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiProvider")
            .field("client", &"<async-openai::Client>")
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAi
    }

    async fn invoke(&self, request: &InvokeRequest) -> Result<InvokeResponse, ProviderError> {
        let openai_request = Self::build_request(request);

        let response = tokio::time::timeout(
            self.timeout,
            self.client.chat().create(openai_request),
        )
        .await
        .map_err(|_| ProviderError::Transient {
            message: format!("request timed out after {:?}", self.timeout),
            status: None,
        })?
        .map_err(|e| map_error(&request.model, &e))?;

        let output_text = response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default();

        let value = parse_structured_object(&output_text)?;
        let usage = Self::map_usage(response.usage.as_ref());

        Ok(InvokeResponse {
            output_text,
            value,
            usage,
            model: response.model,
        })
    }
}

/// Classifies an `async-openai` error for the retry policy.
fn map_error(model: &str, err: &OpenAIError) -> ProviderError {
    match err {
        OpenAIError::ApiError(api) => {
            let message = api.message.clone();
            let lower = message.to_lowercase();
            let kind = api.r#type.as_deref().unwrap_or_default();
            if lower.contains("rate limit")
                || lower.contains("overloaded")
                || lower.contains("server error")
                || kind == "server_error"
            {
                ProviderError::Transient {
                    message,
                    status: None,
                }
            } else if lower.contains("api key") || lower.contains("authentication") {
                ProviderError::AuthInvalid {
                    provider: ProviderKind::OpenAi.tag().to_string(),
                    message,
                }
            } else if lower.contains("schema") {
                ProviderError::SchemaUnsupported {
                    model: model.to_string(),
                    message,
                }
            } else {
                ProviderError::Permanent {
                    message,
                    status: None,
                }
            }
        }
        OpenAIError::JSONDeserialize(e) => ProviderError::Validation {
            message: format!("response body not deserializable: {e}"),
            content: String::new(),
        },
        other => ProviderError::Transient {
            message: other.to_string(),
            status: None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::types::ModelParameters;
    use serde_json::json;

    fn request_for(model: &str) -> InvokeRequest {
        InvokeRequest {
            model: model.to_string(),
            prompt: "extract".to_string(),
            schema_name: "entries".to_string(),
            schema: json!({"type": "object", "properties": {}}),
            params: ModelParameters {
                temperature: Some(0.0),
                top_p: Some(0.9),
                max_output_tokens: 2_048,
                reasoning_effort: Some(ReasoningEffort::High),
            },
        }
    }

    #[test]
    fn test_build_request_chat_model() {
        let built = OpenAiProvider::build_request(&request_for("gpt-4o-mini"));
        assert_eq!(built.temperature, Some(0.0));
        assert_eq!(built.top_p, Some(0.9));
        // Chat models have no deliberation knob
        assert!(built.reasoning_effort.is_none());
        assert!(matches!(
            built.response_format,
            Some(ResponseFormat::JsonSchema { .. })
        ));
    }

    #[test]
    fn test_build_request_reasoning_model() {
        let built = OpenAiProvider::build_request(&request_for("o3-mini"));
        assert!(built.temperature.is_none());
        assert!(built.top_p.is_none());
        assert!(built.reasoning_effort.is_some());
    }

    #[test]
    fn test_schema_name_forwarded() {
        let built = OpenAiProvider::build_request(&request_for("gpt-4o-mini"));
        match built.response_format {
            Some(ResponseFormat::JsonSchema { json_schema }) => {
                assert_eq!(json_schema.name, "entries");
                assert_eq!(json_schema.strict, Some(true));
                assert!(json_schema.schema.is_some());
            }
            _ => unreachable!("expected json schema response format"),
        }
    }

    #[test]
    fn test_map_usage_with_details() {
        let usage: CompletionUsage = serde_json::from_value(json!({
            "prompt_tokens": 1000,
            "completion_tokens": 200,
            "total_tokens": 1200,
            "prompt_tokens_details": {"cached_tokens": 300},
            "completion_tokens_details": {"reasoning_tokens": 50}
        }))
        .unwrap_or_else(|_| unreachable!());
        let mapped = OpenAiProvider::map_usage(Some(&usage));
        assert_eq!(mapped.input, 700);
        assert_eq!(mapped.cached_input, 300);
        assert_eq!(mapped.output, 150);
        assert_eq!(mapped.reasoning, 50);
        assert_eq!(mapped.total(), 1200);
    }

    #[test]
    fn test_map_usage_absent() {
        assert_eq!(OpenAiProvider::map_usage(None), TokenUsage::default());
    }
}
