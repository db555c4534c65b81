//! Repair of partially completed extractions.
//!
//! Repair replays a file's journal and fixes whatever is unfinished:
//! open batches are re-polled (a batch that completed while the process
//! was away is downloaded and ingested), and chunks with neither a
//! response nor a still-open batch covering them are re-queued
//! synchronously. Chunks that failed with a permanent error are only
//! re-submitted under `force` — an unchanged request would fail the same
//! way. A fully ingested file is a no-op.

use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};

use super::BatchManager;
use crate::chunking::{TokenBudgetChunker, chunks_from_ranges, load_line_ranges};
use crate::config::Config;
use crate::context::{ContextSource, PromptTemplate, assemble_context};
use crate::core::{CancelToken, custom_id};
use crate::error::{CommandError, Error, Result};
use crate::extract::journal::{ChunkOutcome, JournalView, JournalWriter, read_journal};
use crate::extract::processor::finalize_journal;
use crate::extract::scheduler::{ChunkJob, Scheduler};
use crate::io::SourceText;
use crate::provider::Provider;
use crate::schema::SchemaRegistry;
use crate::tokens::DailyLedger;

/// Display prefix of transient errors in journal failure records.
const TRANSIENT_PREFIX: &str = "transient provider error";

/// One repair step taken for a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepairAction {
    /// An open batch was polled; results were ingested when available.
    BatchPolled {
        /// Provider batch identifier.
        batch_id: String,
        /// Unified status after the poll.
        status: String,
        /// Chunk results ingested.
        ingested: usize,
    },
    /// Chunks were re-queued through the synchronous pipeline.
    ChunksRequeued {
        /// How many chunks were re-dispatched.
        count: usize,
    },
    /// Nothing was broken.
    AlreadyComplete,
}

/// Result of repairing one file.
#[derive(Debug, Clone)]
pub struct RepairOutcome {
    /// File stem the journal belongs to.
    pub stem: String,
    /// Steps taken, in order.
    pub actions: Vec<RepairAction>,
    /// Whether the journal covers every chunk after repair.
    pub complete: bool,
}

/// Everything repair needs from the surrounding run.
pub struct RepairContext<'a> {
    /// Runtime configuration.
    pub config: &'a Config,
    /// Schema registry for prompt rebuilding.
    pub registry: &'a SchemaRegistry,
    /// Provider for re-queued chunks.
    pub provider: Arc<dyn Provider>,
    /// Shared token ledger.
    pub ledger: Arc<DailyLedger>,
    /// Batch manager, absent when the provider has no batch API.
    pub manager: Option<BatchManager>,
    /// Also re-submit chunks that failed permanently.
    pub force: bool,
    /// Cancellation signal.
    pub cancel: CancelToken,
}

/// Repairs one file from its journal.
///
/// # Errors
///
/// Returns an error when the journal is unreadable, the source file is
/// gone, or re-queued dispatch hits a file-level failure.
pub async fn repair_file(ctx: &RepairContext<'_>, journal_path: &Path) -> Result<RepairOutcome> {
    let stem = crate::extract::journal::stem_from_journal_path(journal_path).ok_or_else(|| {
        Error::from(CommandError::InvalidArgument(format!(
            "not a journal file: {}",
            journal_path.display()
        )))
    })?;

    let mut actions = Vec::new();

    // Step 1: settle open batches
    if let Some(manager) = &ctx.manager {
        for outcome in manager.poll_journal(journal_path).await? {
            actions.push(RepairAction::BatchPolled {
                batch_id: outcome.batch_id,
                status: outcome.status.to_string(),
                ingested: outcome.ingested,
            });
        }
    }

    // Step 2: re-queue uncovered chunks
    let view = read_journal(journal_path)?;
    let has_open_batch = !view.open_batches().is_empty();
    let needs_requeue = requeue_indices(&view, ctx.force);

    if needs_requeue.is_empty() {
        if actions.is_empty() {
            actions.push(RepairAction::AlreadyComplete);
        }
    } else if has_open_batch {
        info!(
            stem = stem.as_str(),
            pending = needs_requeue.len(),
            "chunks still covered by an open batch, not re-queuing"
        );
    } else {
        let count = requeue(ctx, journal_path, &view, &stem, &needs_requeue).await?;
        actions.push(RepairAction::ChunksRequeued { count });
    }

    let view = read_journal(journal_path)?;
    let complete = view.is_complete();
    if complete && !view.chunks.is_empty() {
        finalize_journal(journal_path, ctx.config.retain_temporary_jsonl)?;
    }

    Ok(RepairOutcome {
        stem,
        actions,
        complete,
    })
}

/// Chunk indices that repair should re-dispatch: missing entirely,
/// failed transiently, or (under force) failed permanently.
fn requeue_indices(view: &JournalView, force: bool) -> Vec<usize> {
    (1..=view.meta.chunk_count)
        .filter(|index| match view.chunks.get(index) {
            None => true,
            Some(record) => match &record.response {
                ChunkOutcome::Success { .. } => false,
                ChunkOutcome::Failure { error } => {
                    force || error.starts_with(TRANSIENT_PREFIX)
                }
            },
        })
        .collect()
}

/// Rebuilds the chunks for the journal's source and re-dispatches the
/// selected indices synchronously.
async fn requeue(
    ctx: &RepairContext<'_>,
    journal_path: &Path,
    view: &JournalView,
    stem: &str,
    indices: &[usize],
) -> Result<usize> {
    let input = Path::new(&view.meta.source);
    let source = SourceText::load(input)?;
    let schema = ctx.registry.get(&view.meta.schema)?;

    // Re-derive the original chunk layout: a co-located range file wins,
    // the automatic plan otherwise. A count mismatch means the source or
    // configuration changed since the journal was written.
    let ranges = match load_line_ranges(input)? {
        Some(ranges) => ranges,
        None => TokenBudgetChunker::new(ctx.config.tokens_per_chunk, &view.meta.model)?
            .plan(&source),
    };
    if ranges.len() != view.meta.chunk_count {
        return Err(CommandError::ExecutionFailed(format!(
            "cannot repair {stem}: chunk layout changed ({} planned vs {} journaled); \
             re-run process instead",
            ranges.len(),
            view.meta.chunk_count
        ))
        .into());
    }
    let chunks = chunks_from_ranges(&source, &ranges)?;

    let context = assemble_context(
        true,
        ContextSource::Default,
        &ctx.config.schema_dir,
        input,
    );
    let template = PromptTemplate::load(&ctx.config.schema_dir);
    let jobs: Vec<ChunkJob> = chunks
        .into_iter()
        .filter(|chunk| indices.contains(&chunk.index))
        .map(|chunk| ChunkJob {
            custom_id: custom_id(stem, chunk.index),
            prompt: template.render(&view.meta.schema, &context, &chunk.text),
            chunk,
        })
        .collect();
    let count = jobs.len();

    warn!(stem, count, "re-queuing unfinished chunks");

    let journal = Arc::new(JournalWriter::open_append(journal_path)?);
    let scheduler = Scheduler::new(
        Arc::clone(&ctx.provider),
        Arc::clone(&ctx.ledger),
        crate::extract::scheduler::RetryPolicy {
            attempts: ctx.config.attempts,
            wait_min: ctx.config.wait_min,
            wait_max: ctx.config.wait_max,
            jitter_max: ctx.config.jitter_max,
        },
        ctx.config.concurrency_limit,
        ctx.config.no_wait,
        ctx.cancel.clone(),
    );
    scheduler
        .run(
            &view.meta.model,
            &view.meta.schema,
            &schema.root,
            crate::provider::ModelParameters {
                temperature: ctx.config.temperature,
                top_p: ctx.config.top_p,
                max_output_tokens: ctx.config.max_output_tokens,
                reasoning_effort: ctx
                    .config
                    .reasoning_effort
                    .as_deref()
                    .and_then(crate::provider::ReasoningEffort::parse),
            },
            jobs,
            &journal,
        )
        .await?;

    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::TokenUsage;
    use crate::error::ProviderError;
    use crate::extract::journal::{ChunkRecord, JournalMeta, journal_path};
    use crate::provider::{InvokeRequest, InvokeResponse, ProviderKind};
    use async_trait::async_trait;
    use serde_json::json;
    use tempfile::TempDir;

    struct EchoProvider;

    #[async_trait]
    impl Provider for EchoProvider {
        fn kind(&self) -> ProviderKind {
            ProviderKind::OpenAi
        }

        async fn invoke(
            &self,
            _request: &InvokeRequest,
        ) -> std::result::Result<InvokeResponse, ProviderError> {
            Ok(InvokeResponse {
                output_text: r#"{"repaired": true}"#.to_string(),
                value: json!({"repaired": true}),
                usage: TokenUsage {
                    input: 5,
                    cached_input: 0,
                    output: 2,
                    reasoning: 0,
                },
                model: "gpt-4o-mini".to_string(),
            })
        }
    }

    struct Fixture {
        _dir: TempDir,
        config: Config,
        registry: SchemaRegistry,
        input: std::path::PathBuf,
        journal: std::path::PathBuf,
    }

    fn fixture(records: &[(usize, ChunkOutcome)], chunk_count: usize) -> Fixture {
        let dir = TempDir::new().unwrap();
        let schema_dir = dir.path().join("schemas");
        std::fs::create_dir_all(&schema_dir).unwrap();
        std::fs::write(schema_dir.join("letters.json"), r#"{"type": "object"}"#).unwrap();

        let input = dir.path().join("diary.txt");
        std::fs::write(&input, "only line").unwrap();

        let config = Config::builder()
            .model("gpt-4o-mini")
            .schema_dir(&schema_dir)
            .output_dir(dir.path().join("out"))
            .retain_temporary_jsonl(true)
            .build()
            .unwrap();
        let registry = SchemaRegistry::load(&schema_dir).unwrap();

        let out_dir = config.schema_output_dir("letters");
        let journal = journal_path(&out_dir, "diary");
        let writer = JournalWriter::create(
            &journal,
            &JournalMeta {
                source: input.to_string_lossy().to_string(),
                schema: "letters".to_string(),
                model: "gpt-4o-mini".to_string(),
                chunk_count,
                created_at: "2026-01-01T00:00:00+00:00".to_string(),
            },
        )
        .unwrap();
        for (index, outcome) in records {
            writer
                .append_chunk(&ChunkRecord {
                    custom_id: format!("diary-chunk-{index}"),
                    chunk_index: *index,
                    response: outcome.clone(),
                    usage: None,
                    model: "gpt-4o-mini".to_string(),
                    timestamp: "2026-01-01T00:00:01+00:00".to_string(),
                    attempts: 1,
                })
                .unwrap();
        }
        drop(writer);

        Fixture {
            _dir: dir,
            config,
            registry,
            input,
            journal,
        }
    }

    fn context<'a>(fixture: &'a Fixture, force: bool) -> RepairContext<'a> {
        RepairContext {
            config: &fixture.config,
            registry: &fixture.registry,
            provider: Arc::new(EchoProvider),
            ledger: Arc::new(DailyLedger::open(fixture.config.ledger_path(), None)),
            manager: None,
            force,
            cancel: CancelToken::never(),
        }
    }

    #[tokio::test]
    async fn test_fully_ingested_file_is_noop() {
        let fixture = fixture(
            &[(
                1,
                ChunkOutcome::Success {
                    output_text: "{}".to_string(),
                },
            )],
            1,
        );
        let ctx = context(&fixture, false);
        let outcome = repair_file(&ctx, &fixture.journal).await.unwrap();
        assert_eq!(outcome.actions, vec![RepairAction::AlreadyComplete]);
        assert!(outcome.complete);
    }

    #[tokio::test]
    async fn test_missing_chunk_requeued() {
        let fixture = fixture(&[], 1);
        let ctx = context(&fixture, false);
        let outcome = repair_file(&ctx, &fixture.journal).await.unwrap();
        assert_eq!(outcome.actions, vec![RepairAction::ChunksRequeued { count: 1 }]);
        assert!(outcome.complete);

        let view = read_journal(&fixture.journal).unwrap();
        assert!(view.chunks[&1].response.is_success());
    }

    #[tokio::test]
    async fn test_transient_failure_requeued_without_force() {
        let fixture = fixture(
            &[(
                1,
                ChunkOutcome::Failure {
                    error: "transient provider error (HTTP 503): overloaded".to_string(),
                },
            )],
            1,
        );
        let ctx = context(&fixture, false);
        let outcome = repair_file(&ctx, &fixture.journal).await.unwrap();
        assert_eq!(outcome.actions, vec![RepairAction::ChunksRequeued { count: 1 }]);
    }

    #[tokio::test]
    async fn test_permanent_failure_needs_force() {
        let fixture = fixture(
            &[(
                1,
                ChunkOutcome::Failure {
                    error: "permanent provider error (HTTP 400): bad request".to_string(),
                },
            )],
            1,
        );

        let ctx = context(&fixture, false);
        let outcome = repair_file(&ctx, &fixture.journal).await.unwrap();
        assert_eq!(outcome.actions, vec![RepairAction::AlreadyComplete]);

        let ctx = context(&fixture, true);
        let outcome = repair_file(&ctx, &fixture.journal).await.unwrap();
        assert_eq!(outcome.actions, vec![RepairAction::ChunksRequeued { count: 1 }]);

        let view = read_journal(&fixture.journal).unwrap();
        assert!(view.chunks[&1].response.is_success());
    }

    #[tokio::test]
    async fn test_layout_mismatch_refuses_repair() {
        // Journal claims 5 chunks, but the one-line source plans 1
        let fixture = fixture(&[], 5);
        let ctx = context(&fixture, false);
        let err = repair_file(&ctx, &fixture.journal).await.unwrap_err();
        assert!(err.to_string().contains("chunk layout changed"));
    }

    #[test]
    fn test_requeue_indices_classification() {
        let fixture = fixture(
            &[
                (
                    1,
                    ChunkOutcome::Success {
                        output_text: "{}".to_string(),
                    },
                ),
                (
                    2,
                    ChunkOutcome::Failure {
                        error: "transient provider error: timeout".to_string(),
                    },
                ),
                (
                    3,
                    ChunkOutcome::Failure {
                        error: "permanent provider error (HTTP 400): no".to_string(),
                    },
                ),
            ],
            4,
        );
        let view = read_journal(&fixture.journal).unwrap();
        assert_eq!(requeue_indices(&view, false), vec![2, 4]);
        assert_eq!(requeue_indices(&view, true), vec![2, 3, 4]);
    }
}
