//! Bounded-concurrency chunk dispatch with retry and backoff.
//!
//! Chunk requests for one file fan out across a semaphore-bounded worker
//! pool. Each worker owns its retry state: transient provider errors back
//! off exponentially with uniform jitter, permanent and validation errors
//! fail only their own chunk, and the daily token ledger is consulted
//! before and settled after every attempt sequence. Chunk order is not
//! preserved here; the aggregator re-establishes it from chunk indices.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use super::journal::{ChunkOutcome, ChunkRecord, JournalWriter};
use crate::core::{CancelToken, Chunk, TokenUsage};
use crate::error::{Error, ProviderError, Result};
use crate::provider::{InvokeRequest, ModelParameters, Provider};
use crate::tokens::{self, DailyLedger};

/// One unit of work: a chunk with its rendered prompt and identifier.
#[derive(Debug, Clone)]
pub struct ChunkJob {
    /// The chunk being extracted.
    pub chunk: Chunk,
    /// Stable request identifier.
    pub custom_id: String,
    /// Fully rendered prompt.
    pub prompt: String,
}

/// Retry timing knobs for transient failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Attempts per request (first try plus retries).
    pub attempts: u32,
    /// Initial backoff delay.
    pub wait_min: Duration,
    /// Backoff ceiling.
    pub wait_max: Duration,
    /// Maximum uniform jitter added to each delay.
    pub jitter_max: Duration,
}

impl RetryPolicy {
    /// Computes the backoff delay before retry number `attempt` (1-based
    /// count of failures so far): exponential doubling from `wait_min`,
    /// capped at `wait_max`, plus uniform jitter.
    #[must_use]
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let base = self
            .wait_min
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.wait_max);
        let jitter_ms = if self.jitter_max.is_zero() {
            0
        } else {
            rand::rng().random_range(0..=self.jitter_max.as_millis() as u64)
        };
        base + Duration::from_millis(jitter_ms)
    }
}

/// Outcome counters for one file's dispatch.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunSummary {
    /// Chunks with a success record.
    pub succeeded: usize,
    /// Chunks with a failure record.
    pub failed: usize,
    /// Chunks abandoned by cancellation (no record written).
    pub cancelled: usize,
    /// Accumulated token usage across successful chunks.
    pub usage: TokenUsage,
}

/// Per-chunk terminal state inside the pool.
enum ChunkFate {
    Succeeded(TokenUsage),
    Failed,
    Cancelled,
}

/// Bounded-parallel dispatcher for one file's chunk requests.
pub struct Scheduler {
    provider: Arc<dyn Provider>,
    ledger: Arc<DailyLedger>,
    policy: RetryPolicy,
    concurrency_limit: usize,
    no_wait: bool,
    cancel: CancelToken,
}

impl Scheduler {
    /// Creates a scheduler over a provider and ledger.
    #[must_use]
    pub fn new(
        provider: Arc<dyn Provider>,
        ledger: Arc<DailyLedger>,
        policy: RetryPolicy,
        concurrency_limit: usize,
        no_wait: bool,
        cancel: CancelToken,
    ) -> Self {
        Self {
            provider,
            ledger,
            policy,
            concurrency_limit: concurrency_limit.max(1),
            no_wait,
            cancel,
        }
    }

    /// Dispatches all jobs, journaling every terminal outcome.
    ///
    /// Chunk-level failures are contained: a permanent error on one chunk
    /// never aborts its siblings. File-level failures — exhausted daily
    /// budget in non-blocking mode, rejected schema, invalid credentials —
    /// abort the whole run after in-flight workers wind down.
    ///
    /// # Errors
    ///
    /// Returns the first file-level error encountered.
    pub async fn run(
        &self,
        model: &str,
        schema_name: &str,
        schema: &serde_json::Value,
        params: ModelParameters,
        jobs: Vec<ChunkJob>,
        journal: &Arc<JournalWriter>,
    ) -> Result<RunSummary> {
        let semaphore = Arc::new(Semaphore::new(self.concurrency_limit));
        let mut handles = Vec::with_capacity(jobs.len());

        for job in jobs {
            let semaphore = Arc::clone(&semaphore);
            let provider = Arc::clone(&self.provider);
            let ledger = Arc::clone(&self.ledger);
            let journal = Arc::clone(journal);
            let cancel = self.cancel.clone();
            let policy = self.policy;
            let no_wait = self.no_wait;
            let request = InvokeRequest {
                model: model.to_string(),
                prompt: job.prompt.clone(),
                schema_name: schema_name.to_string(),
                schema: schema.clone(),
                params,
            };

            let handle = tokio::spawn(async move {
                let _permit = semaphore.acquire().await.map_err(|e| {
                    Error::Command(crate::error::CommandError::ExecutionFailed(format!(
                        "semaphore closed: {e}"
                    )))
                })?;
                run_one(
                    &*provider, &ledger, &journal, &policy, no_wait, &cancel, &job, request,
                )
                .await
            });
            handles.push(handle);
        }

        let results = futures_util::future::join_all(handles).await;

        let mut summary = RunSummary::default();
        let mut first_error: Option<Error> = None;
        for result in results {
            match result {
                Ok(Ok(ChunkFate::Succeeded(usage))) => {
                    summary.succeeded += 1;
                    summary.usage.add(&usage);
                }
                Ok(Ok(ChunkFate::Failed)) => summary.failed += 1,
                Ok(Ok(ChunkFate::Cancelled)) => summary.cancelled += 1,
                Ok(Err(e)) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(Error::Command(
                            crate::error::CommandError::ExecutionFailed(format!(
                                "worker task failed: {e}"
                            )),
                        ));
                    }
                }
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }

        info!(
            succeeded = summary.succeeded,
            failed = summary.failed,
            cancelled = summary.cancelled,
            tokens = summary.usage.total(),
            "chunk dispatch finished"
        );
        Ok(summary)
    }
}

/// Runs one chunk to a terminal state: success record, failure record, or
/// cancellation. File-level failures come back as `Err`.
#[allow(clippy::too_many_arguments)]
async fn run_one(
    provider: &dyn Provider,
    ledger: &DailyLedger,
    journal: &JournalWriter,
    policy: &RetryPolicy,
    no_wait: bool,
    cancel: &CancelToken,
    job: &ChunkJob,
    request: InvokeRequest,
) -> Result<ChunkFate> {
    if cancel.is_cancelled() {
        return Ok(ChunkFate::Cancelled);
    }

    let input_estimate = tokens::count(&job.prompt, &request.model) as u64;
    let estimate = input_estimate + u64::from(request.params.max_output_tokens);
    ledger.acquire(estimate, no_wait, cancel).await?;

    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        if cancel.is_cancelled() {
            // Release the reservation; nothing was sent on this attempt
            ledger.commit(estimate, 0).await?;
            return Ok(ChunkFate::Cancelled);
        }

        match provider.invoke(&request).await {
            Ok(response) => {
                ledger.commit(estimate, response.usage.total()).await?;
                journal.append_chunk(&ChunkRecord {
                    custom_id: job.custom_id.clone(),
                    chunk_index: job.chunk.index,
                    response: ChunkOutcome::Success {
                        output_text: response.output_text,
                    },
                    usage: Some(response.usage),
                    model: response.model,
                    timestamp: chrono::Local::now().to_rfc3339(),
                    attempts: attempt,
                })?;
                debug!(custom_id = %job.custom_id, attempt, "chunk succeeded");
                return Ok(ChunkFate::Succeeded(response.usage));
            }
            Err(e) if is_file_fatal(&e) => {
                ledger.commit(estimate, input_estimate).await?;
                return Err(e.into());
            }
            Err(e) if e.is_retryable() && attempt < policy.attempts => {
                let delay = policy.backoff_delay(attempt);
                warn!(
                    custom_id = %job.custom_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "transient failure, backing off"
                );
                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    () = cancel.cancelled() => {
                        ledger.commit(estimate, input_estimate).await?;
                        return Ok(ChunkFate::Cancelled);
                    }
                }
            }
            Err(e) => {
                // Attempts are spent or the error is final for this chunk.
                // Input tokens were likely consumed; settle the
                // reservation down to the input share.
                ledger.commit(estimate, input_estimate).await?;
                let error = match &e {
                    ProviderError::Validation { message, content } => {
                        format!("{message}; response preserved: {content}")
                    }
                    other => other.to_string(),
                };
                journal.append_chunk(&ChunkRecord {
                    custom_id: job.custom_id.clone(),
                    chunk_index: job.chunk.index,
                    response: ChunkOutcome::Failure { error },
                    usage: None,
                    model: request.model.clone(),
                    timestamp: chrono::Local::now().to_rfc3339(),
                    attempts: attempt,
                })?;
                warn!(custom_id = %job.custom_id, attempt, error = %e, "chunk failed");
                return Ok(ChunkFate::Failed);
            }
        }
    }
}

/// Errors that abort the whole file rather than one chunk.
const fn is_file_fatal(error: &ProviderError) -> bool {
    matches!(
        error,
        ProviderError::AuthMissing { .. }
            | ProviderError::AuthInvalid { .. }
            | ProviderError::SchemaUnsupported { .. }
            | ProviderError::UnknownModel { .. }
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::LineRange;
    use crate::extract::journal::{JournalMeta, journal_path, read_journal};
    use crate::provider::{InvokeResponse, ProviderKind};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Mock provider with per-custom-id failure scripts.
    struct MockProvider {
        /// Number of transient failures before success, keyed by prompt
        /// marker.
        transient_before_success: HashMap<String, u32>,
        calls: Mutex<HashMap<String, u32>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        permanent_markers: Vec<String>,
    }

    impl MockProvider {
        fn new() -> Self {
            Self {
                transient_before_success: HashMap::new(),
                calls: Mutex::new(HashMap::new()),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                permanent_markers: Vec::new(),
            }
        }

        fn with_transient(mut self, marker: &str, failures: u32) -> Self {
            self.transient_before_success
                .insert(marker.to_string(), failures);
            self
        }

        fn with_permanent(mut self, marker: &str) -> Self {
            self.permanent_markers.push(marker.to_string());
            self
        }

        fn observed_max_in_flight(&self) -> usize {
            self.max_in_flight.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Provider for MockProvider {
        fn kind(&self) -> ProviderKind {
            ProviderKind::OpenAi
        }

        async fn invoke(
            &self,
            request: &InvokeRequest,
        ) -> std::result::Result<InvokeResponse, ProviderError> {
            let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(current, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let marker = request
                .prompt
                .split_whitespace()
                .next()
                .unwrap_or_default()
                .to_string();

            if self.permanent_markers.contains(&marker) {
                return Err(ProviderError::Permanent {
                    message: "bad request".to_string(),
                    status: Some(400),
                });
            }

            let mut calls = self
                .calls
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            let seen = calls.entry(marker.clone()).or_insert(0);
            *seen += 1;
            if let Some(&failures) = self.transient_before_success.get(&marker)
                && *seen <= failures
            {
                return Err(ProviderError::Transient {
                    message: "503 service unavailable".to_string(),
                    status: Some(503),
                });
            }

            Ok(InvokeResponse {
                output_text: format!(r#"{{"marker": "{marker}"}}"#),
                value: serde_json::json!({"marker": marker}),
                usage: TokenUsage {
                    input: 50,
                    cached_input: 0,
                    output: 10,
                    reasoning: 0,
                },
                model: request.model.clone(),
            })
        }
    }

    fn jobs_of(count: usize) -> Vec<ChunkJob> {
        (1..=count)
            .map(|i| ChunkJob {
                chunk: Chunk::new(i, LineRange::new(i, i), format!("line {i}")),
                custom_id: format!("doc-chunk-{i}"),
                prompt: format!("c{i} extract this"),
            })
            .collect()
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            attempts: 3,
            wait_min: Duration::from_millis(1),
            wait_max: Duration::from_millis(4),
            jitter_max: Duration::from_millis(1),
        }
    }

    fn scheduler_with(
        provider: Arc<dyn Provider>,
        ledger: Arc<DailyLedger>,
        concurrency: usize,
    ) -> Scheduler {
        Scheduler::new(
            provider,
            ledger,
            fast_policy(),
            concurrency,
            true,
            CancelToken::never(),
        )
    }

    fn journal_in(dir: &TempDir, chunk_count: usize) -> Arc<JournalWriter> {
        let writer = JournalWriter::create(
            journal_path(dir.path(), "doc"),
            &JournalMeta {
                source: "doc.txt".to_string(),
                schema: "letters".to_string(),
                model: "gpt-4o-mini".to_string(),
                chunk_count,
                created_at: "2026-01-01T00:00:00+00:00".to_string(),
            },
        )
        .unwrap();
        Arc::new(writer)
    }

    async fn run_jobs(
        scheduler: &Scheduler,
        jobs: Vec<ChunkJob>,
        journal: &Arc<JournalWriter>,
    ) -> Result<RunSummary> {
        scheduler
            .run(
                "gpt-4o-mini",
                "letters",
                &serde_json::json!({"type": "object"}),
                ModelParameters {
                    temperature: Some(0.0),
                    top_p: None,
                    max_output_tokens: 256,
                    reasoning_effort: None,
                },
                jobs,
                journal,
            )
            .await
    }

    #[tokio::test]
    async fn test_all_chunks_succeed() {
        let dir = TempDir::new().unwrap();
        let ledger = Arc::new(DailyLedger::open(dir.path().join("state.json"), None));
        let provider = Arc::new(MockProvider::new());
        let journal = journal_in(&dir, 3);
        let scheduler = scheduler_with(provider, ledger, 4);

        let summary = run_jobs(&scheduler, jobs_of(3), &journal).await.unwrap();
        assert_eq!(summary.succeeded, 3);
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.usage.total(), 3 * 60);

        let view = read_journal(journal.path()).unwrap();
        assert!(view.is_complete());
    }

    #[tokio::test]
    async fn test_transient_then_success_records_attempts() {
        let dir = TempDir::new().unwrap();
        let ledger = Arc::new(DailyLedger::open(dir.path().join("state.json"), None));
        // Chunk 2 fails twice with 503 before succeeding
        let provider = Arc::new(MockProvider::new().with_transient("c2", 2));
        let journal = journal_in(&dir, 3);
        let scheduler = scheduler_with(provider, ledger, 4);

        let summary = run_jobs(&scheduler, jobs_of(3), &journal).await.unwrap();
        assert_eq!(summary.succeeded, 3);

        let view = read_journal(journal.path()).unwrap();
        assert_eq!(view.chunks[&2].attempts, 3);
        assert_eq!(view.chunks[&1].attempts, 1);
        assert!(view.chunks[&2].response.is_success());
    }

    #[tokio::test]
    async fn test_permanent_failure_contained_to_chunk() {
        let dir = TempDir::new().unwrap();
        let ledger = Arc::new(DailyLedger::open(dir.path().join("state.json"), None));
        let provider = Arc::new(MockProvider::new().with_permanent("c2"));
        let journal = journal_in(&dir, 3);
        let scheduler = scheduler_with(provider, ledger, 4);

        let summary = run_jobs(&scheduler, jobs_of(3), &journal).await.unwrap();
        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.failed, 1);

        let view = read_journal(journal.path()).unwrap();
        assert!(!view.chunks[&2].response.is_success());
        assert!(view.chunks[&1].response.is_success());
        assert!(view.chunks[&3].response.is_success());
    }

    #[tokio::test]
    async fn test_retries_exhausted_becomes_chunk_failure() {
        let dir = TempDir::new().unwrap();
        let ledger = Arc::new(DailyLedger::open(dir.path().join("state.json"), None));
        // More failures than the 3-attempt budget
        let provider = Arc::new(MockProvider::new().with_transient("c1", 99));
        let journal = journal_in(&dir, 1);
        let scheduler = scheduler_with(provider, ledger, 1);

        let summary = run_jobs(&scheduler, jobs_of(1), &journal).await.unwrap();
        assert_eq!(summary.failed, 1);

        let view = read_journal(journal.path()).unwrap();
        assert_eq!(view.chunks[&1].attempts, 3);
    }

    #[tokio::test]
    async fn test_concurrency_bounded() {
        let dir = TempDir::new().unwrap();
        let ledger = Arc::new(DailyLedger::open(dir.path().join("state.json"), None));
        let provider = Arc::new(MockProvider::new());
        let journal = journal_in(&dir, 12);
        let scheduler = scheduler_with(Arc::clone(&provider) as Arc<dyn Provider>, ledger, 2);

        run_jobs(&scheduler, jobs_of(12), &journal).await.unwrap();
        assert!(provider.observed_max_in_flight() <= 2);
    }

    #[tokio::test]
    async fn test_no_wait_budget_exhaustion_aborts_file() {
        let dir = TempDir::new().unwrap();
        // Limit fits roughly one request (input estimate + 256 cap)
        let ledger = Arc::new(DailyLedger::open(
            dir.path().join("state.json"),
            Some(300),
        ));
        let provider = Arc::new(MockProvider::new());
        let journal = journal_in(&dir, 4);
        let scheduler = scheduler_with(provider, ledger, 1);

        let err = run_jobs(&scheduler, jobs_of(4), &journal).await.unwrap_err();
        assert!(matches!(err, Error::Ledger(_)));
    }

    #[tokio::test]
    async fn test_ledger_settles_to_actual_usage() {
        let dir = TempDir::new().unwrap();
        let ledger = Arc::new(DailyLedger::open(
            dir.path().join("state.json"),
            Some(100_000),
        ));
        let provider = Arc::new(MockProvider::new());
        let journal = journal_in(&dir, 2);
        let scheduler = scheduler_with(provider, Arc::clone(&ledger), 2);

        run_jobs(&scheduler, jobs_of(2), &journal).await.unwrap();
        let (used, _, _) = ledger.current_usage().await;
        // Two successes at 60 actual tokens each
        assert_eq!(used, 120);
    }

    #[tokio::test]
    async fn test_cancellation_stops_pending_chunks() {
        let dir = TempDir::new().unwrap();
        let ledger = Arc::new(DailyLedger::open(dir.path().join("state.json"), None));
        let provider = Arc::new(MockProvider::new());
        let journal = journal_in(&dir, 8);
        let (handle, token) = CancelToken::pair();
        let scheduler = Scheduler::new(
            provider,
            ledger,
            fast_policy(),
            1,
            true,
            token,
        );
        handle.cancel();

        let summary = run_jobs(&scheduler, jobs_of(8), &journal).await.unwrap();
        assert_eq!(summary.succeeded + summary.failed, 0);
        assert_eq!(summary.cancelled, 8);
    }

    #[test]
    fn test_backoff_delay_growth_and_cap() {
        let policy = RetryPolicy {
            attempts: 5,
            wait_min: Duration::from_secs(1),
            wait_max: Duration::from_secs(8),
            jitter_max: Duration::ZERO,
        };
        assert_eq!(policy.backoff_delay(1), Duration::from_secs(1));
        assert_eq!(policy.backoff_delay(2), Duration::from_secs(2));
        assert_eq!(policy.backoff_delay(3), Duration::from_secs(4));
        assert_eq!(policy.backoff_delay(4), Duration::from_secs(8));
        // Capped
        assert_eq!(policy.backoff_delay(10), Duration::from_secs(8));
    }

    #[test]
    fn test_backoff_jitter_bounded() {
        let policy = RetryPolicy {
            attempts: 5,
            wait_min: Duration::from_millis(100),
            wait_max: Duration::from_millis(100),
            jitter_max: Duration::from_millis(50),
        };
        for _ in 0..50 {
            let delay = policy.backoff_delay(1);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(150));
        }
    }
}
