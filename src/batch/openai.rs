//! `OpenAI` batch backend over the Files and Batches APIs.
//!
//! Chunk requests are serialized as JSONL batch input lines, uploaded as
//! a file, and submitted against the chat completions endpoint with a
//! 24-hour completion window. Results come back as a JSONL output file
//! correlated by `custom_id`.

use std::time::Duration;

use async_openai::Client;
use async_openai::config::OpenAIConfig;
use async_openai::types::{
    Batch, BatchCompletionWindow, BatchEndpoint, BatchRequest, BatchRequestInput,
    BatchRequestInputMethod, BatchStatus as OpenAiBatchStatus, CreateChatCompletionResponse,
    CreateFileRequest, FileInput, FilePurpose,
};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use super::{BatchBackend, BatchChunkRequest, BatchResultItem, BatchStatus};
use crate::core::TokenUsage;
use crate::error::{BatchError, ProviderError};
use crate::extract::journal::ChunkOutcome;
use crate::provider::ProviderKind;
use crate::provider::openai::OpenAiProvider;

/// One line of the batch output file.
#[derive(Debug, Deserialize)]
struct OutputLine {
    custom_id: String,
    #[serde(default)]
    response: Option<OutputResponse>,
    #[serde(default)]
    error: Option<OutputError>,
}

#[derive(Debug, Deserialize)]
struct OutputResponse {
    #[serde(default)]
    status_code: Option<u16>,
    #[serde(default)]
    body: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct OutputError {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Batch transport for the `OpenAI` platform.
pub struct OpenAiBatchBackend {
    client: Client<OpenAIConfig>,
    timeout: Duration,
}

impl OpenAiBatchBackend {
    /// Creates a backend from `OPENAI_API_KEY`.
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

    /// Serializes the batch input file, one request per line.
    fn render_input(requests: &[BatchChunkRequest]) -> Result<Vec<u8>, BatchError> {
        let mut buffer = Vec::new();
        for entry in requests {
            let body = serde_json::to_value(OpenAiProvider::build_request(&entry.request))
                .map_err(|e| {
                    BatchError::Api(ProviderError::Permanent {
                        message: format!("request serialization failed: {e}"),
                        status: None,
                    })
                })?;
            let line = BatchRequestInput {
                custom_id: entry.custom_id.clone(),
                method: BatchRequestInputMethod::POST,
                url: BatchEndpoint::V1ChatCompletions,
                body: Some(body),
            };
            let json = serde_json::to_string(&line).map_err(|e| {
                BatchError::Api(ProviderError::Permanent {
                    message: format!("input line serialization failed: {e}"),
                    status: None,
                })
            })?;
            buffer.extend_from_slice(json.as_bytes());
            buffer.push(b'\n');
        }
        Ok(buffer)
    }

    /// Translates one output line into a journal-ready result item.
    fn translate_line(line: OutputLine) -> BatchResultItem {
        if let Some(error) = line.error {
            return BatchResultItem {
                custom_id: line.custom_id,
                outcome: ChunkOutcome::Failure {
                    error: format!(
                        "{}: {}",
                        error.code.unwrap_or_else(|| "error".to_string()),
                        error.message.unwrap_or_default()
                    ),
                },
                usage: None,
            };
        }

        let Some(response) = line.response else {
            return BatchResultItem {
                custom_id: line.custom_id,
                outcome: ChunkOutcome::Failure {
                    error: "batch output line has neither response nor error".to_string(),
                },
                usage: None,
            };
        };

        if response.status_code.is_some_and(|code| code >= 300) {
            return BatchResultItem {
                custom_id: line.custom_id,
                outcome: ChunkOutcome::Failure {
                    error: format!(
                        "HTTP {}: {}",
                        response.status_code.unwrap_or_default(),
                        response.body
                    ),
                },
                usage: None,
            };
        }

        match serde_json::from_value::<CreateChatCompletionResponse>(response.body.clone()) {
            Ok(completion) => {
                let output_text = completion
                    .choices
                    .first()
                    .and_then(|c| c.message.content.clone())
                    .unwrap_or_default();
                let usage = completion.usage.map(|u| TokenUsage {
                    input: u64::from(u.prompt_tokens),
                    cached_input: 0,
                    output: u64::from(u.completion_tokens),
                    reasoning: 0,
                });
                BatchResultItem {
                    custom_id: line.custom_id,
                    outcome: ChunkOutcome::Success { output_text },
                    usage,
                }
            }
            Err(e) => BatchResultItem {
                custom_id: line.custom_id,
                outcome: ChunkOutcome::Failure {
                    error: format!("unparseable completion body: {e}"),
                },
                usage: None,
            },
        }
    }

    async fn retrieve(&self, batch_id: &str) -> Result<Batch, BatchError> {
        tokio::time::timeout(self.timeout, self.client.batches().retrieve(batch_id))
            .await
            .map_err(|_| {
                BatchError::Api(ProviderError::Transient {
                    message: format!("batch retrieve timed out after {:?}", self.timeout),
                    status: None,
                })
            })?
            .map_err(|e| {
                BatchError::Api(ProviderError::Transient {
                    message: e.to_string(),
                    status: None,
                })
            })
    }
}

/// Maps provider batch states onto the unified vocabulary.
const fn unify_status(status: &OpenAiBatchStatus) -> BatchStatus {
    match status {
        OpenAiBatchStatus::Validating => BatchStatus::Validating,
        OpenAiBatchStatus::InProgress => BatchStatus::InProgress,
        OpenAiBatchStatus::Finalizing => BatchStatus::Finalizing,
        OpenAiBatchStatus::Completed => BatchStatus::Completed,
        OpenAiBatchStatus::Failed => BatchStatus::Failed,
        OpenAiBatchStatus::Expired => BatchStatus::Expired,
        OpenAiBatchStatus::Cancelling | OpenAiBatchStatus::Cancelled => BatchStatus::Cancelled,
    }
}

impl std::fmt::Debug for OpenAiBatchBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiBatchBackend")
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[async_trait]
impl BatchBackend for OpenAiBatchBackend {
    fn provider(&self) -> ProviderKind {
        ProviderKind::OpenAi
    }

    async fn submit(&self, requests: &[BatchChunkRequest]) -> Result<String, BatchError> {
        let input = Self::render_input(requests)?;
        debug!(bytes = input.len(), lines = requests.len(), "uploading batch input");

        let file = self
            .client
            .files()
            .create(CreateFileRequest {
                file: FileInput::from_vec_u8("batch_input.jsonl".to_string(), input),
                purpose: FilePurpose::Batch,
            })
            .await
            .map_err(|e| {
                BatchError::Api(ProviderError::Transient {
                    message: format!("input upload failed: {e}"),
                    status: None,
                })
            })?;

        let batch = self
            .client
            .batches()
            .create(BatchRequest {
                input_file_id: file.id,
                endpoint: BatchEndpoint::V1ChatCompletions,
                completion_window: BatchCompletionWindow::W24H,
                metadata: None,
            })
            .await
            .map_err(|e| {
                BatchError::Api(ProviderError::Transient {
                    message: format!("batch creation failed: {e}"),
                    status: None,
                })
            })?;

        Ok(batch.id)
    }

    async fn status(&self, batch_id: &str) -> Result<BatchStatus, BatchError> {
        let batch = self.retrieve(batch_id).await?;
        Ok(unify_status(&batch.status))
    }

    async fn download(&self, batch_id: &str) -> Result<Vec<BatchResultItem>, BatchError> {
        let batch = self.retrieve(batch_id).await?;
        let status = unify_status(&batch.status);
        let Some(output_file_id) = batch.output_file_id else {
            return Err(BatchError::NotReady {
                batch_id: batch_id.to_string(),
                status: status.to_string(),
            });
        };

        let content = self
            .client
            .files()
            .content(&output_file_id)
            .await
            .map_err(|e| {
                BatchError::Api(ProviderError::Transient {
                    message: format!("output download failed: {e}"),
                    status: None,
                })
            })?;

        let text = String::from_utf8_lossy(&content);
        let mut items = Vec::new();
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str::<OutputLine>(line) {
                Ok(parsed) => items.push(Self::translate_line(parsed)),
                Err(e) => {
                    debug!(error = %e, "skipping unparseable batch output line");
                }
            }
        }
        Ok(items)
    }

    async fn cancel(&self, batch_id: &str) -> Result<BatchStatus, BatchError> {
        let batch = self.retrieve(batch_id).await?;
        if unify_status(&batch.status).is_terminal() {
            return Ok(unify_status(&batch.status));
        }
        let cancelled = self
            .client
            .batches()
            .cancel(batch_id)
            .await
            .map_err(|e| {
                BatchError::Api(ProviderError::Transient {
                    message: e.to_string(),
                    status: None,
                })
            })?;
        Ok(unify_status(&cancelled.status))
    }
}
