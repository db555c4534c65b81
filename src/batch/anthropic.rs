//! Anthropic batch backend over the Message Batches API.
//!
//! Requests are submitted inline; results are streamed back as JSONL from
//! the batch's results URL. Anthropic's `processing` maps to
//! `in_progress`, and `ended` resolves to a terminal status from the
//! request counts.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::{BatchBackend, BatchChunkRequest, BatchResultItem, BatchStatus};
use crate::error::{BatchError, ProviderError};
use crate::extract::journal::ChunkOutcome;
use crate::provider::ProviderKind;
use crate::provider::anthropic::AnthropicProvider;

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";

#[derive(Debug, Deserialize)]
struct BatchResponse {
    id: String,
    processing_status: String,
    #[serde(default)]
    request_counts: RequestCounts,
    #[serde(default)]
    results_url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RequestCounts {
    #[serde(default)]
    succeeded: u64,
    #[serde(default)]
    errored: u64,
    #[serde(default)]
    canceled: u64,
    #[serde(default)]
    expired: u64,
}

#[derive(Debug, Deserialize)]
struct ResultLine {
    custom_id: String,
    result: ResultBody,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ResultBody {
    Succeeded { message: serde_json::Value },
    Errored { error: serde_json::Value },
    Canceled {},
    Expired {},
}

/// Batch transport for the Anthropic platform.
pub struct AnthropicBatchBackend {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl AnthropicBatchBackend {
    /// Creates a backend from `ANTHROPIC_API_KEY`.
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

    async fn fetch_batch(&self, batch_id: &str) -> Result<BatchResponse, BatchError> {
        let response = self
            .http
            .get(format!("{}/v1/messages/batches/{batch_id}", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .send()
            .await
            .map_err(|e| BatchError::Api(ProviderError::from(e)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(BatchError::Api(
                crate::provider::anthropic::map_error_response("batch", status.as_u16(), &text),
            ));
        }
        response
            .json()
            .await
            .map_err(|e| {
                BatchError::Api(ProviderError::Validation {
                    message: format!("batch body not deserializable: {e}"),
                    content: String::new(),
                })
            })
    }

    fn translate_line(line: ResultLine) -> BatchResultItem {
        match line.result {
            ResultBody::Succeeded { message } => {
                match AnthropicProvider::parse_message_value(&message) {
                    Ok((output_text, _, usage)) => BatchResultItem {
                        custom_id: line.custom_id,
                        outcome: ChunkOutcome::Success { output_text },
                        usage: Some(usage),
                    },
                    Err(e) => BatchResultItem {
                        custom_id: line.custom_id,
                        outcome: ChunkOutcome::Failure {
                            error: e.to_string(),
                        },
                        usage: None,
                    },
                }
            }
            ResultBody::Errored { error } => BatchResultItem {
                custom_id: line.custom_id,
                outcome: ChunkOutcome::Failure {
                    error: error.to_string(),
                },
                usage: None,
            },
            ResultBody::Canceled {} => BatchResultItem {
                custom_id: line.custom_id,
                outcome: ChunkOutcome::Failure {
                    error: "request canceled with the batch".to_string(),
                },
                usage: None,
            },
            ResultBody::Expired {} => BatchResultItem {
                custom_id: line.custom_id,
                outcome: ChunkOutcome::Failure {
                    error: "request expired before processing".to_string(),
                },
                usage: None,
            },
        }
    }
}

/// Resolves the unified status from processing state and counts.
fn unify_status(batch: &BatchResponse) -> BatchStatus {
    match batch.processing_status.as_str() {
        "in_progress" | "processing" => BatchStatus::InProgress,
        "canceling" => BatchStatus::InProgress,
        "ended" => {
            let counts = &batch.request_counts;
            if counts.succeeded > 0 {
                BatchStatus::Completed
            } else if counts.canceled > 0 {
                BatchStatus::Cancelled
            } else if counts.expired > 0 {
                BatchStatus::Expired
            } else if counts.errored > 0 {
                BatchStatus::Failed
            } else {
                BatchStatus::Completed
            }
        }
        _ => BatchStatus::Validating,
    }
}

impl std::fmt::Debug for AnthropicBatchBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnthropicBatchBackend")
            .field("base_url", &self.base_url)
            .finish()
    }
}

#[async_trait]
impl BatchBackend for AnthropicBatchBackend {
    fn provider(&self) -> ProviderKind {
        ProviderKind::Anthropic
    }

    async fn submit(&self, requests: &[BatchChunkRequest]) -> Result<String, BatchError> {
        let entries: Vec<serde_json::Value> = requests
            .iter()
            .map(|entry| {
                json!({
                    "custom_id": entry.custom_id,
                    "params": AnthropicProvider::request_body(&entry.request),
                })
            })
            .collect();

        let response = self
            .http
            .post(format!("{}/v1/messages/batches", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&json!({"requests": entries}))
            .send()
            .await
            .map_err(|e| BatchError::Api(ProviderError::from(e)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(BatchError::Api(
                crate::provider::anthropic::map_error_response("batch", status.as_u16(), &text),
            ));
        }

        let batch: BatchResponse = response.json().await.map_err(|e| {
            BatchError::Api(ProviderError::Validation {
                message: format!("batch body not deserializable: {e}"),
                content: String::new(),
            })
        })?;
        Ok(batch.id)
    }

    async fn status(&self, batch_id: &str) -> Result<BatchStatus, BatchError> {
        Ok(unify_status(&self.fetch_batch(batch_id).await?))
    }

    async fn download(&self, batch_id: &str) -> Result<Vec<BatchResultItem>, BatchError> {
        let batch = self.fetch_batch(batch_id).await?;
        let status = unify_status(&batch);
        let Some(results_url) = batch.results_url else {
            return Err(BatchError::NotReady {
                batch_id: batch_id.to_string(),
                status: status.to_string(),
            });
        };

        let response = self
            .http
            .get(&results_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .send()
            .await
            .map_err(|e| BatchError::Api(ProviderError::from(e)))?;
        let text = response
            .text()
            .await
            .map_err(|e| BatchError::Api(ProviderError::from(e)))?;

        let mut items = Vec::new();
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str::<ResultLine>(line) {
                Ok(parsed) => items.push(Self::translate_line(parsed)),
                Err(e) => {
                    debug!(error = %e, "skipping unparseable batch result line");
                }
            }
        }
        Ok(items)
    }

    async fn cancel(&self, batch_id: &str) -> Result<BatchStatus, BatchError> {
        let current = self.fetch_batch(batch_id).await?;
        if unify_status(&current).is_terminal() {
            return Ok(unify_status(&current));
        }

        let response = self
            .http
            .post(format!(
                "{}/v1/messages/batches/{batch_id}/cancel",
                self.base_url
            ))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .send()
            .await
            .map_err(|e| BatchError::Api(ProviderError::from(e)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(BatchError::Api(
                crate::provider::anthropic::map_error_response("batch", status.as_u16(), &text),
            ));
        }
        let batch: BatchResponse = response.json().await.map_err(|e| {
            BatchError::Api(ProviderError::Validation {
                message: format!("batch body not deserializable: {e}"),
                content: String::new(),
            })
        })?;
        Ok(unify_status(&batch))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(processing_status: &str, counts: RequestCounts) -> BatchResponse {
        BatchResponse {
            id: "msgbatch_1".to_string(),
            processing_status: processing_status.to_string(),
            request_counts: counts,
            results_url: None,
        }
    }

    #[test]
    fn test_processing_maps_to_in_progress() {
        let status = unify_status(&batch("in_progress", RequestCounts::default()));
        assert_eq!(status, BatchStatus::InProgress);
    }

    #[test]
    fn test_ended_resolves_by_counts() {
        let completed = batch(
            "ended",
            RequestCounts {
                succeeded: 3,
                errored: 1,
                ..RequestCounts::default()
            },
        );
        assert_eq!(unify_status(&completed), BatchStatus::Completed);

        let failed = batch(
            "ended",
            RequestCounts {
                errored: 4,
                ..RequestCounts::default()
            },
        );
        assert_eq!(unify_status(&failed), BatchStatus::Failed);

        let cancelled = batch(
            "ended",
            RequestCounts {
                canceled: 2,
                ..RequestCounts::default()
            },
        );
        assert_eq!(unify_status(&cancelled), BatchStatus::Cancelled);

        let expired = batch(
            "ended",
            RequestCounts {
                expired: 2,
                ..RequestCounts::default()
            },
        );
        assert_eq!(unify_status(&expired), BatchStatus::Expired);
    }

    #[test]
    fn test_translate_errored_line() {
        let line: ResultLine = serde_json::from_value(json!({
            "custom_id": "doc-chunk-1",
            "result": {"type": "errored", "error": {"type": "invalid_request", "message": "no"}}
        }))
        .unwrap();
        let item = AnthropicBatchBackend::translate_line(line);
        assert!(!item.outcome.is_success());
    }

    #[test]
    fn test_translate_succeeded_line() {
        let line: ResultLine = serde_json::from_value(json!({
            "custom_id": "doc-chunk-1",
            "result": {
                "type": "succeeded",
                "message": {
                    "content": [{"type": "tool_use", "name": "record_extraction", "input": {"entries": []}}],
                    "usage": {"input_tokens": 9, "output_tokens": 4},
                    "model": "claude-sonnet-4-5"
                }
            }
        }))
        .unwrap();
        let item = AnthropicBatchBackend::translate_line(line);
        assert!(item.outcome.is_success());
        assert_eq!(item.usage.unwrap().total(), 13);
    }

    #[test]
    fn test_translate_canceled_line() {
        let line: ResultLine = serde_json::from_value(json!({
            "custom_id": "doc-chunk-1",
            "result": {"type": "canceled"}
        }))
        .unwrap();
        let item = AnthropicBatchBackend::translate_line(line);
        assert!(!item.outcome.is_success());
    }
}
