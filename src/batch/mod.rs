//! Asynchronous batch job lifecycle.
//!
//! Batch mode serializes a file's chunk requests into the provider's
//! batch input format, submits one job, and tracks it through a unified
//! state vocabulary until results are downloaded and ingested into the
//! journal. Tracking records live in the journal itself, so repair after
//! a crash needs no second source of truth.
//!
//! ```text
//!  validating → in_progress → finalizing → completed
//!            ↘ failed / expired / cancelled
//! ```

pub mod anthropic;
pub mod google;
pub mod openai;
pub mod repair;

pub use repair::{RepairAction, RepairContext, RepairOutcome, repair_file};

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::core::{TokenUsage, parse_custom_id};
use crate::error::{BatchError, Result};
use crate::extract::journal::{
    BatchRecord, ChunkOutcome, ChunkRecord, JournalView, JournalWriter, read_journal,
};
use crate::provider::{InvokeRequest, ProviderKind};
use crate::tokens::DailyLedger;

/// Unified batch status vocabulary exposed to users.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    /// Submitted, input not yet validated.
    Validating,
    /// Requests are being processed.
    InProgress,
    /// Processing done, results being assembled.
    Finalizing,
    /// Results are available for download.
    Completed,
    /// The batch terminated adversely.
    Failed,
    /// The provider expired the batch before completion.
    Expired,
    /// The batch was cancelled.
    Cancelled,
}

impl BatchStatus {
    /// Whether no further provider-side transitions are possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Expired | Self::Cancelled
        )
    }
}

impl std::fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Validating => "validating",
            Self::InProgress => "in_progress",
            Self::Finalizing => "finalizing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Expired => "expired",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// One chunk request inside a batch submission.
#[derive(Debug, Clone)]
pub struct BatchChunkRequest {
    /// Stable request identifier.
    pub custom_id: String,
    /// Provider-agnostic request payload.
    pub request: InvokeRequest,
}

/// One downloaded batch result, correlated by `custom_id`.
#[derive(Debug, Clone)]
pub struct BatchResultItem {
    /// Stable request identifier.
    pub custom_id: String,
    /// Success or failure payload in journal form.
    pub outcome: ChunkOutcome,
    /// Token usage, when the provider reported it.
    pub usage: Option<TokenUsage>,
}

/// Provider-specific batch transport.
#[async_trait]
pub trait BatchBackend: Send + Sync {
    /// Which provider this backend talks to.
    fn provider(&self) -> ProviderKind;

    /// Uploads and submits one batch; returns the provider batch id.
    async fn submit(&self, requests: &[BatchChunkRequest]) -> std::result::Result<String, BatchError>;

    /// Fetches the unified status of a batch.
    async fn status(&self, batch_id: &str) -> std::result::Result<BatchStatus, BatchError>;

    /// Downloads all per-chunk results of a completed batch.
    async fn download(
        &self,
        batch_id: &str,
    ) -> std::result::Result<Vec<BatchResultItem>, BatchError>;

    /// Best-effort cancellation; terminal states are left unchanged.
    async fn cancel(&self, batch_id: &str) -> std::result::Result<BatchStatus, BatchError>;
}

/// Creates the batch backend for a provider.
///
/// # Errors
///
/// Returns [`BatchError::Unsupported`] for providers without a batch API.
pub fn create_backend(
    kind: ProviderKind,
    timeout: Duration,
) -> std::result::Result<Box<dyn BatchBackend>, BatchError> {
    match kind {
        ProviderKind::OpenAi => Ok(Box::new(openai::OpenAiBatchBackend::from_env(timeout)?)),
        ProviderKind::Anthropic => Ok(Box::new(anthropic::AnthropicBatchBackend::from_env(
            timeout,
        )?)),
        ProviderKind::Google => Ok(Box::new(google::GoogleBatchBackend::from_env(timeout)?)),
        ProviderKind::OpenRouter => Err(BatchError::Unsupported {
            provider: kind.tag().to_string(),
        }),
    }
}

/// What a poll pass did for one batch.
#[derive(Debug, Clone)]
pub struct PollOutcome {
    /// Provider batch identifier.
    pub batch_id: String,
    /// Status after the poll.
    pub status: BatchStatus,
    /// Chunk results ingested into the journal by this pass.
    pub ingested: usize,
}

/// Drives batch submission, polling, download, and cancellation against
/// the journal.
pub struct BatchManager {
    backend: Box<dyn BatchBackend>,
    ledger: Arc<DailyLedger>,
}

impl BatchManager {
    /// Creates a manager over a backend and the shared ledger.
    #[must_use]
    pub fn new(backend: Box<dyn BatchBackend>, ledger: Arc<DailyLedger>) -> Self {
        Self { backend, ledger }
    }

    /// The provider this manager submits to.
    #[must_use]
    pub fn provider(&self) -> ProviderKind {
        self.backend.provider()
    }

    /// Submits one file's requests as a batch, writing the tracking
    /// record and the submission debug file.
    ///
    /// # Errors
    ///
    /// Returns an error when submission or journaling fails.
    pub async fn submit_file(
        &self,
        journal: &JournalWriter,
        source_file: &str,
        requests: Vec<BatchChunkRequest>,
    ) -> Result<BatchRecord> {
        let batch_id = self.backend.submit(&requests).await?;
        let record = BatchRecord::submitted(
            batch_id.clone(),
            self.backend.provider(),
            requests.len(),
            source_file,
        );
        journal.append_batch(&record)?;
        write_submission_debug(journal.path(), &record, &requests)?;
        info!(
            batch_id = %batch_id,
            chunks = requests.len(),
            provider = %self.backend.provider(),
            "batch submitted"
        );
        Ok(record)
    }

    /// Polls every open batch in a journal, ingesting results of batches
    /// that completed.
    ///
    /// # Errors
    ///
    /// Returns an error when the journal cannot be read or appended;
    /// per-batch provider failures are reported in the outcomes instead.
    pub async fn poll_journal(&self, journal_path: &Path) -> Result<Vec<PollOutcome>> {
        let view = read_journal(journal_path)?;
        let open: Vec<BatchRecord> = view.open_batches().into_iter().cloned().collect();
        if open.is_empty() {
            return Ok(Vec::new());
        }

        let writer = JournalWriter::open_append(journal_path)?;
        let mut outcomes = Vec::with_capacity(open.len());

        for mut record in open {
            let status = match self.backend.status(&record.batch_id).await {
                Ok(status) => status,
                Err(e) => {
                    warn!(batch_id = %record.batch_id, error = %e, "status poll failed");
                    outcomes.push(PollOutcome {
                        batch_id: record.batch_id,
                        status: record.status,
                        ingested: 0,
                    });
                    continue;
                }
            };

            let mut ingested = 0;
            if status == BatchStatus::Completed {
                ingested = self.ingest(&writer, &view, &record.batch_id).await?;
            }

            if status != record.status {
                record.status = status;
                writer.append_batch(&record)?;
            }
            outcomes.push(PollOutcome {
                batch_id: record.batch_id,
                status,
                ingested,
            });
        }

        Ok(outcomes)
    }

    /// Downloads a completed batch's results into the journal.
    ///
    /// Results for chunks that already carry a success record are skipped
    /// so re-polling stays idempotent. Token usage reported by the batch
    /// is committed to the ledger (batches are never reserved up front).
    async fn ingest(
        &self,
        writer: &JournalWriter,
        view: &JournalView,
        batch_id: &str,
    ) -> Result<usize> {
        let items = self.backend.download(batch_id).await?;
        let mut ingested = 0;

        for item in items {
            let Some((_, chunk_index)) = parse_custom_id(&item.custom_id) else {
                warn!(custom_id = %item.custom_id, "unparseable custom_id in batch results");
                continue;
            };
            let already_succeeded = view
                .chunks
                .get(&chunk_index)
                .is_some_and(|r| r.response.is_success());
            if already_succeeded {
                continue;
            }

            if let Some(usage) = item.usage {
                self.ledger.commit(0, usage.total()).await?;
            }
            writer.append_chunk(&ChunkRecord {
                custom_id: item.custom_id.clone(),
                chunk_index,
                response: item.outcome,
                usage: item.usage,
                model: view.meta.model.clone(),
                timestamp: chrono::Local::now().to_rfc3339(),
                attempts: 1,
            })?;
            ingested += 1;
        }

        info!(batch_id, ingested, "batch results ingested");
        Ok(ingested)
    }

    /// Cancels every open batch in a journal.
    ///
    /// # Errors
    ///
    /// Returns an error when the journal cannot be read or appended.
    pub async fn cancel_journal(
        &self,
        journal_path: &Path,
    ) -> Result<Vec<(String, BatchStatus)>> {
        let view = read_journal(journal_path)?;
        let open: Vec<BatchRecord> = view.open_batches().into_iter().cloned().collect();
        if open.is_empty() {
            return Ok(Vec::new());
        }

        let writer = JournalWriter::open_append(journal_path)?;
        let mut results = Vec::with_capacity(open.len());
        for mut record in open {
            match self.backend.cancel(&record.batch_id).await {
                Ok(status) => {
                    record.status = status;
                    writer.append_batch(&record)?;
                    results.push((record.batch_id, status));
                }
                Err(e) => {
                    warn!(batch_id = %record.batch_id, error = %e, "cancel failed");
                    results.push((record.batch_id, record.status));
                }
            }
        }
        Ok(results)
    }
}

/// Writes the `<stem>_batch_submission_debug.json` companion.
fn write_submission_debug(
    journal_path: &Path,
    record: &BatchRecord,
    requests: &[BatchChunkRequest],
) -> Result<()> {
    let stem = crate::extract::journal::stem_from_journal_path(journal_path)
        .unwrap_or_else(|| "batch".to_string());
    let debug_path = journal_path.with_file_name(format!("{stem}_batch_submission_debug.json"));
    let custom_ids: Vec<&str> = requests.iter().map(|r| r.custom_id.as_str()).collect();
    let body = json!({
        "batch_id": record.batch_id,
        "provider": record.provider,
        "submitted_at": record.submitted_at,
        "chunk_count": record.chunk_count,
        "source_file": record.source_file,
        "custom_ids": custom_ids,
    });
    crate::io::atomic_write_file(
        &debug_path,
        &serde_json::to_string_pretty(&body).unwrap_or_default(),
    )
}
