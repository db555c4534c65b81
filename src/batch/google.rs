//! Google Gemini batch backend over the `batchGenerateContent` API.
//!
//! Submission creates a long-running batch operation with inlined
//! requests, each tagged with the chunk's `custom_id` in its metadata.
//! Polling reads the operation's batch state (`BATCH_STATE_PENDING`,
//! `BATCH_STATE_RUNNING`, …); completed operations carry their responses
//! inline.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::debug;

use super::{BatchBackend, BatchChunkRequest, BatchResultItem, BatchStatus};
use crate::error::{BatchError, ProviderError};
use crate::extract::journal::ChunkOutcome;
use crate::provider::ProviderKind;
use crate::provider::google::{self, GoogleProvider};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

/// Batch transport for the Google Gemini API.
pub struct GoogleBatchBackend {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl GoogleBatchBackend {
    /// Creates a backend from `GOOGLE_API_KEY`.
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

    async fn fetch_operation(&self, batch_id: &str) -> Result<Value, BatchError> {
        let response = self
            .http
            .get(format!("{}/v1beta/{batch_id}", self.base_url))
            .header("x-goog-api-key", &self.api_key)
            .send()
            .await
            .map_err(|e| BatchError::Api(ProviderError::from(e)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(BatchError::Api(map_http_error(status.as_u16(), &text)));
        }
        response.json().await.map_err(|e| {
            BatchError::Api(ProviderError::Validation {
                message: format!("operation body not deserializable: {e}"),
                content: String::new(),
            })
        })
    }

    fn translate_inlined(entry: &Value) -> Option<BatchResultItem> {
        let custom_id = entry
            .pointer("/metadata/key")
            .and_then(Value::as_str)?
            .to_string();

        if let Some(error) = entry.get("error") {
            return Some(BatchResultItem {
                custom_id,
                outcome: ChunkOutcome::Failure {
                    error: error.to_string(),
                },
                usage: None,
            });
        }

        let response = entry.get("response")?;
        match google::parse_generate_value(response) {
            Ok((output_text, _, usage)) => Some(BatchResultItem {
                custom_id,
                outcome: ChunkOutcome::Success { output_text },
                usage: Some(usage),
            }),
            Err(e) => Some(BatchResultItem {
                custom_id,
                outcome: ChunkOutcome::Failure {
                    error: e.to_string(),
                },
                usage: None,
            }),
        }
    }
}

/// Maps Gemini batch states onto the unified vocabulary.
fn unify_state(state: &str) -> Option<BatchStatus> {
    match state {
        "BATCH_STATE_PENDING" | "STATE_PENDING" => Some(BatchStatus::Validating),
        "BATCH_STATE_RUNNING" | "STATE_RUNNING" => Some(BatchStatus::InProgress),
        "BATCH_STATE_SUCCEEDED" | "STATE_SUCCEEDED" => Some(BatchStatus::Completed),
        "BATCH_STATE_FAILED" | "STATE_FAILED" => Some(BatchStatus::Failed),
        "BATCH_STATE_CANCELLED" | "STATE_CANCELLED" => Some(BatchStatus::Cancelled),
        "BATCH_STATE_EXPIRED" | "STATE_EXPIRED" => Some(BatchStatus::Expired),
        _ => None,
    }
}

fn operation_status(operation: &Value, batch_id: &str) -> Result<BatchStatus, BatchError> {
    let state = operation
        .pointer("/metadata/state")
        .or_else(|| operation.pointer("/metadata/batchStats/state"))
        .and_then(Value::as_str)
        .unwrap_or_default();
    unify_state(state).ok_or_else(|| BatchError::UnknownState {
        state: state.to_string(),
        batch_id: batch_id.to_string(),
    })
}

fn map_http_error(status: u16, body: &str) -> ProviderError {
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
        _ => ProviderError::Permanent {
            message,
            status: Some(status),
        },
    }
}

impl std::fmt::Debug for GoogleBatchBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GoogleBatchBackend")
            .field("base_url", &self.base_url)
            .finish()
    }
}

#[async_trait]
impl BatchBackend for GoogleBatchBackend {
    fn provider(&self) -> ProviderKind {
        ProviderKind::Google
    }

    async fn submit(&self, requests: &[BatchChunkRequest]) -> Result<String, BatchError> {
        let Some(first) = requests.first() else {
            return Err(BatchError::Api(ProviderError::Permanent {
                message: "cannot submit an empty batch".to_string(),
                status: None,
            }));
        };
        let model = first.request.model.clone();

        let entries: Vec<Value> = requests
            .iter()
            .map(|entry| {
                json!({
                    "request": GoogleProvider::build_body(&entry.request),
                    "metadata": {"key": entry.custom_id},
                })
            })
            .collect();
        let body = json!({
            "batch": {
                "displayName": "chronominer extraction",
                "inputConfig": {"requests": {"requests": entries}},
            }
        });

        let response = self
            .http
            .post(format!(
                "{}/v1beta/models/{model}:batchGenerateContent",
                self.base_url
            ))
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| BatchError::Api(ProviderError::from(e)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(BatchError::Api(map_http_error(status.as_u16(), &text)));
        }

        let operation: Value = response.json().await.map_err(|e| {
            BatchError::Api(ProviderError::Validation {
                message: format!("operation body not deserializable: {e}"),
                content: String::new(),
            })
        })?;
        operation
            .get("name")
            .and_then(Value::as_str)
            .map(ToString::to_string)
            .ok_or_else(|| {
                BatchError::Api(ProviderError::Validation {
                    message: "operation has no name".to_string(),
                    content: operation.to_string(),
                })
            })
    }

    async fn status(&self, batch_id: &str) -> Result<BatchStatus, BatchError> {
        let operation = self.fetch_operation(batch_id).await?;
        operation_status(&operation, batch_id)
    }

    async fn download(&self, batch_id: &str) -> Result<Vec<BatchResultItem>, BatchError> {
        let operation = self.fetch_operation(batch_id).await?;
        let status = operation_status(&operation, batch_id)?;
        if status != BatchStatus::Completed {
            return Err(BatchError::NotReady {
                batch_id: batch_id.to_string(),
                status: status.to_string(),
            });
        }

        let inlined = operation
            .pointer("/response/inlinedResponses/inlinedResponses")
            .or_else(|| operation.pointer("/response/inlinedResponses"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut items = Vec::new();
        for entry in &inlined {
            if let Some(item) = Self::translate_inlined(entry) {
                items.push(item);
            } else {
                debug!("skipping inlined response without metadata key");
            }
        }
        Ok(items)
    }

    async fn cancel(&self, batch_id: &str) -> Result<BatchStatus, BatchError> {
        let operation = self.fetch_operation(batch_id).await?;
        let status = operation_status(&operation, batch_id)?;
        if status.is_terminal() {
            return Ok(status);
        }

        let response = self
            .http
            .post(format!("{}/v1beta/{batch_id}:cancel", self.base_url))
            .header("x-goog-api-key", &self.api_key)
            .send()
            .await
            .map_err(|e| BatchError::Api(ProviderError::from(e)))?;

        if !response.status().is_success() {
            let code = response.status().as_u16();
            let text = response.text().await.unwrap_or_default();
            return Err(BatchError::Api(map_http_error(code, &text)));
        }
        Ok(BatchStatus::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unify_state_vocabulary() {
        assert_eq!(unify_state("STATE_PENDING"), Some(BatchStatus::Validating));
        assert_eq!(unify_state("STATE_RUNNING"), Some(BatchStatus::InProgress));
        assert_eq!(unify_state("STATE_SUCCEEDED"), Some(BatchStatus::Completed));
        assert_eq!(unify_state("STATE_FAILED"), Some(BatchStatus::Failed));
        assert_eq!(unify_state("BATCH_STATE_RUNNING"), Some(BatchStatus::InProgress));
        assert_eq!(unify_state("STATE_UNSPECIFIED"), None);
    }

    #[test]
    fn test_operation_status_unknown_state() {
        let operation = json!({"metadata": {"state": "STATE_WOBBLY"}});
        let err = operation_status(&operation, "batches/9").unwrap_err();
        assert!(matches!(err, BatchError::UnknownState { .. }));
    }

    #[test]
    fn test_translate_inlined_success() {
        let entry = json!({
            "metadata": {"key": "doc-chunk-2"},
            "response": {
                "candidates": [{"content": {"parts": [{"text": "{\"entries\": []}"}]}}],
                "usageMetadata": {"promptTokenCount": 8, "candidatesTokenCount": 3}
            }
        });
        let item = GoogleBatchBackend::translate_inlined(&entry).unwrap();
        assert_eq!(item.custom_id, "doc-chunk-2");
        assert!(item.outcome.is_success());
        assert_eq!(item.usage.unwrap().total(), 11);
    }

    #[test]
    fn test_translate_inlined_error() {
        let entry = json!({
            "metadata": {"key": "doc-chunk-3"},
            "error": {"code": 13, "message": "internal"}
        });
        let item = GoogleBatchBackend::translate_inlined(&entry).unwrap();
        assert!(!item.outcome.is_success());
    }

    #[test]
    fn test_translate_inlined_without_key() {
        let entry = json!({"response": {}});
        assert!(GoogleBatchBackend::translate_inlined(&entry).is_none());
    }

    #[test]
    fn test_map_http_error_classes() {
        assert!(map_http_error(500, "{}").is_retryable());
        assert!(map_http_error(429, "{}").is_retryable());
        assert!(matches!(
            map_http_error(403, "{}"),
            ProviderError::AuthInvalid { .. }
        ));
        assert!(matches!(
            map_http_error(404, "{}"),
            ProviderError::Permanent { .. }
        ));
    }
}
