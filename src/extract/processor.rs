//! Per-file extraction driver.
//!
//! For each input file: load and normalize, chunk (optionally refining
//! boundaries), render prompts with the context bundle, dispatch
//! synchronously through the scheduler or submit one batch, then fold the
//! journal into the aggregate. A journal that already covers every chunk
//! is replayed without issuing a single provider call.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};

use super::aggregate::{Aggregate, aggregate_path, build_aggregate, write_aggregate};
use super::journal::{JournalMeta, JournalView, JournalWriter, journal_path, read_journal};
use super::scheduler::{ChunkJob, RetryPolicy, Scheduler};
use crate::batch::{BatchChunkRequest, BatchManager, create_backend};
use crate::chunking::{
    ChunkStrategy, TokenBudgetChunker, chunks_from_ranges, load_line_ranges, save_line_ranges,
};
use crate::config::Config;
use crate::context::{ContextSource, PromptTemplate, assemble_context};
use crate::core::{CancelToken, LineRange, TokenUsage, custom_id};
use crate::error::{ChunkingError, Error, Result};
use crate::io::SourceText;
use crate::provider::{
    InvokeRequest, ModelParameters, Provider, ProviderKind, ReasoningEffort, capabilities,
};
use crate::chunking::BoundaryRefiner;
use crate::schema::{SchemaDescriptor, SchemaRegistry};
use crate::tokens::DailyLedger;

/// How a file's requests were dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Synchronous bounded-concurrency dispatch; results are in.
    Sync,
    /// Batch submission; results arrive out-of-band.
    Batch,
}

/// Summary of one file's processing.
#[derive(Debug, Clone)]
pub struct FileReport {
    /// Input file path.
    pub file: PathBuf,
    /// File stem used for output naming.
    pub stem: String,
    /// Number of chunks planned for the file.
    pub chunk_count: usize,
    /// Chunks with a success record (sync mode only).
    pub succeeded: usize,
    /// Chunks with a failure record (sync mode only).
    pub failed: usize,
    /// Whether the aggregate is partial.
    pub partial: bool,
    /// Token usage across successful chunks.
    pub usage: TokenUsage,
    /// Dispatch mode.
    pub mode: RunMode,
    /// Batch id, in batch mode.
    pub batch_id: Option<String>,
    /// Where the aggregate was written, when it was.
    pub aggregate_path: Option<PathBuf>,
    /// Whether the run was satisfied from an existing complete journal.
    pub resumed: bool,
}

/// Drives one file through chunking, dispatch, and aggregation.
pub struct FileProcessor<'a> {
    config: &'a Config,
    registry: &'a SchemaRegistry,
    provider: Arc<dyn Provider>,
    ledger: Arc<DailyLedger>,
    cancel: CancelToken,
}

impl<'a> FileProcessor<'a> {
    /// Creates a processor over shared run state.
    #[must_use]
    pub fn new(
        config: &'a Config,
        registry: &'a SchemaRegistry,
        provider: Arc<dyn Provider>,
        ledger: Arc<DailyLedger>,
        cancel: CancelToken,
    ) -> Self {
        Self {
            config,
            registry,
            provider,
            ledger,
            cancel,
        }
    }

    /// Processes one input file end to end.
    ///
    /// # Errors
    ///
    /// Returns file-level errors: unknown schema, missing range file,
    /// exhausted daily budget in non-blocking mode, rejected schema, or
    /// invalid credentials. Chunk-level failures are folded into the
    /// report instead.
    pub async fn process_file(
        &self,
        input: &Path,
        schema_name: &str,
        strategy: ChunkStrategy,
        batch: bool,
        context_enabled: bool,
        context_source: ContextSource,
    ) -> Result<FileReport> {
        let schema = self.registry.get(schema_name)?;
        let out_dir = self.config.schema_output_dir(schema_name);
        let stem = file_stem(input);
        let source = SourceText::load(input)?;

        info!(
            file = %input.display(),
            schema = schema_name,
            strategy = strategy.name(),
            lines = source.line_count(),
            "processing file"
        );

        if source.is_empty() {
            return self.emit_empty(input, &stem, schema_name, &out_dir);
        }

        // A complete journal satisfies the run without a single provider
        // call, including refinement queries.
        let jpath = journal_path(&out_dir, &stem);
        if let Some(view) = reusable_journal(&jpath, input, &self.config.model) {
            info!(file = %input.display(), "journal already complete, rebuilding aggregate");
            let (aggregate, path) = finalize_view(&view, &jpath, self.config.retain_temporary_jsonl)?;
            return Ok(FileReport {
                file: input.to_path_buf(),
                stem,
                chunk_count: aggregate.meta.chunk_count,
                succeeded: aggregate.chunks.iter().filter(|c| c.response.is_some()).count(),
                failed: aggregate.chunks.iter().filter(|c| c.error.is_some()).count(),
                partial: aggregate.meta.partial,
                usage: TokenUsage::default(),
                mode: RunMode::Sync,
                batch_id: None,
                aggregate_path: Some(path),
                resumed: true,
            });
        }

        let ranges = self.plan_ranges(input, &source, strategy, schema_name).await?;
        let chunks = chunks_from_ranges(&source, &ranges)?;
        crate::chunking::validate_chunks(&chunks, source.line_count())?;

        let context = assemble_context(
            context_enabled,
            context_source,
            &self.config.schema_dir,
            input,
        );
        let template = PromptTemplate::load(&self.config.schema_dir);
        let jobs: Vec<ChunkJob> = chunks
            .iter()
            .map(|chunk| ChunkJob {
                chunk: chunk.clone(),
                custom_id: custom_id(&stem, chunk.index),
                prompt: template.render(schema_name, &context, &chunk.text),
            })
            .collect();

        let meta = JournalMeta {
            source: input.to_string_lossy().to_string(),
            schema: schema_name.to_string(),
            model: self.config.model.clone(),
            chunk_count: chunks.len(),
            created_at: chrono::Local::now().to_rfc3339(),
        };
        let journal = Arc::new(JournalWriter::create(&jpath, &meta)?);

        let use_batch = batch && self.batch_available();
        if use_batch {
            return self
                .submit_batch(input, &stem, schema, jobs, &journal)
                .await;
        }

        let params = self.model_parameters();
        let scheduler = Scheduler::new(
            Arc::clone(&self.provider),
            Arc::clone(&self.ledger),
            self.retry_policy(),
            self.config.concurrency_limit,
            self.config.no_wait,
            self.cancel.clone(),
        );
        let summary = scheduler
            .run(
                &self.config.model,
                schema_name,
                &schema.root,
                params,
                jobs,
                &journal,
            )
            .await?;
        drop(journal);

        let (aggregate, agg_path) =
            finalize_journal(&jpath, self.config.retain_temporary_jsonl)?;

        Ok(FileReport {
            file: input.to_path_buf(),
            stem,
            chunk_count: aggregate.meta.chunk_count,
            succeeded: summary.succeeded,
            failed: summary.failed,
            partial: aggregate.meta.partial,
            usage: summary.usage,
            mode: RunMode::Sync,
            batch_id: None,
            aggregate_path: Some(agg_path),
            resumed: false,
        })
    }

    /// Plans chunk ranges per strategy, running refinement when asked.
    async fn plan_ranges(
        &self,
        input: &Path,
        source: &SourceText,
        strategy: ChunkStrategy,
        schema_name: &str,
    ) -> Result<Vec<LineRange>> {
        let base = match strategy {
            ChunkStrategy::Automatic | ChunkStrategy::AutomaticAdjusted => {
                TokenBudgetChunker::new(self.config.tokens_per_chunk, &self.config.model)?
                    .plan(source)
            }
            ChunkStrategy::LineRanges | ChunkStrategy::LineRangesAdjusted => {
                load_line_ranges(input)?.ok_or_else(|| {
                    Error::from(ChunkingError::MissingLineRanges {
                        path: input.to_string_lossy().to_string(),
                    })
                })?
            }
            ChunkStrategy::PerFile => match load_line_ranges(input)? {
                Some(ranges) => {
                    info!(file = %input.display(), "using co-located line ranges");
                    ranges
                }
                None => {
                    info!(file = %input.display(), "no line ranges, falling back to automatic");
                    TokenBudgetChunker::new(self.config.tokens_per_chunk, &self.config.model)?
                        .plan(source)
                }
            },
        };

        if !strategy.refines() {
            return Ok(base);
        }

        let refiner = BoundaryRefiner::new(
            &*self.provider,
            &self.ledger,
            self.config.model.as_str(),
            schema_name,
            self.config.refinement.clone(),
        )
        .with_no_wait(self.config.no_wait)
        .with_cancel(self.cancel.clone());
        let report = refiner.refine(source, &base).await?;
        if report.changed() {
            save_line_ranges(input, &report.ranges)?;
            info!(
                file = %input.display(),
                boundaries = report.decisions.len(),
                "refined ranges persisted"
            );
        }
        Ok(report.ranges)
    }

    /// Whether the configured provider supports batch jobs; logs an
    /// advisory when it does not.
    fn batch_available(&self) -> bool {
        let supported = capabilities(&self.config.model)
            .map(|caps| caps.batch_supported)
            .unwrap_or(false);
        if !supported {
            warn!(
                model = %self.config.model,
                "batch mode not supported for this provider, falling back to synchronous"
            );
        }
        supported
    }

    async fn submit_batch(
        &self,
        input: &Path,
        stem: &str,
        schema: &SchemaDescriptor,
        jobs: Vec<ChunkJob>,
        journal: &Arc<JournalWriter>,
    ) -> Result<FileReport> {
        let kind = ProviderKind::detect(
            &self.config.model,
            self.config.provider_override.as_deref(),
        )?;
        let backend = create_backend(kind, self.config.timeout)?;
        let manager = BatchManager::new(backend, Arc::clone(&self.ledger));

        let params = self.model_parameters();
        let chunk_count = jobs.len();
        let requests: Vec<BatchChunkRequest> = jobs
            .into_iter()
            .map(|job| BatchChunkRequest {
                custom_id: job.custom_id,
                request: InvokeRequest {
                    model: self.config.model.clone(),
                    prompt: job.prompt,
                    schema_name: schema.name.clone(),
                    schema: schema.root.clone(),
                    params,
                },
            })
            .collect();

        let record = manager
            .submit_file(journal, &input.to_string_lossy(), requests)
            .await?;

        Ok(FileReport {
            file: input.to_path_buf(),
            stem: stem.to_string(),
            chunk_count,
            succeeded: 0,
            failed: 0,
            partial: false,
            usage: TokenUsage::default(),
            mode: RunMode::Batch,
            batch_id: Some(record.batch_id),
            aggregate_path: None,
            resumed: false,
        })
    }

    fn emit_empty(
        &self,
        input: &Path,
        stem: &str,
        schema_name: &str,
        out_dir: &Path,
    ) -> Result<FileReport> {
        warn!(file = %input.display(), "empty file, nothing to extract");
        let aggregate = Aggregate {
            meta: super::aggregate::AggregateMeta {
                file: input.to_string_lossy().to_string(),
                schema: schema_name.to_string(),
                model: self.config.model.clone(),
                chunk_count: 0,
                generated_at: chrono::Local::now().to_rfc3339(),
                partial: false,
            },
            chunks: Vec::new(),
        };
        let path = aggregate_path(out_dir, stem);
        write_aggregate(&path, &aggregate)?;
        Ok(FileReport {
            file: input.to_path_buf(),
            stem: stem.to_string(),
            chunk_count: 0,
            succeeded: 0,
            failed: 0,
            partial: false,
            usage: TokenUsage::default(),
            mode: RunMode::Sync,
            batch_id: None,
            aggregate_path: Some(path),
            resumed: false,
        })
    }

    /// Requested model parameters from configuration.
    #[must_use]
    pub fn model_parameters(&self) -> ModelParameters {
        ModelParameters {
            temperature: self.config.temperature,
            top_p: self.config.top_p,
            max_output_tokens: self.config.max_output_tokens,
            reasoning_effort: self
                .config
                .reasoning_effort
                .as_deref()
                .and_then(ReasoningEffort::parse),
        }
    }

    /// Retry policy from configuration.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.config.attempts,
            wait_min: self.config.wait_min,
            wait_max: self.config.wait_max,
            jitter_max: self.config.jitter_max,
        }
    }
}

/// Returns the file stem used for output naming.
#[must_use]
pub fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map_or_else(|| "input".to_string(), |s| s.to_string_lossy().to_string())
}

/// Checks whether an existing journal fully covers this run.
///
/// A journal is reusable when it belongs to the same source and model
/// and already has a record for every expected chunk. Chunk-count
/// equality with a fresh plan is deliberately not required: the journal
/// is internally consistent, and re-deriving the plan could itself cost
/// refinement queries.
fn reusable_journal(jpath: &Path, input: &Path, model: &str) -> Option<JournalView> {
    if !jpath.exists() {
        return None;
    }
    match read_journal(jpath) {
        Ok(view)
            if view.meta.source == input.to_string_lossy()
                && view.meta.model == model
                && view.meta.chunk_count > 0
                && view.is_complete() =>
        {
            Some(view)
        }
        Ok(_) => None,
        Err(e) => {
            warn!(path = %jpath.display(), error = %e, "ignoring unreadable journal");
            None
        }
    }
}

/// Folds a journal into its aggregate, applying the retention policy.
///
/// The journal is deleted only after a successful aggregate write, and
/// only when retention is off and the aggregate is complete — a partial
/// aggregate keeps its journal for repair.
///
/// # Errors
///
/// Returns an error when the journal cannot be read or the aggregate
/// cannot be written.
pub fn finalize_journal(jpath: &Path, retain: bool) -> Result<(Aggregate, PathBuf)> {
    let view = read_journal(jpath)?;
    finalize_view(&view, jpath, retain)
}

fn finalize_view(
    view: &JournalView,
    jpath: &Path,
    retain: bool,
) -> Result<(Aggregate, PathBuf)> {
    let aggregate = build_aggregate(view);
    let stem = super::journal::stem_from_journal_path(jpath)
        .unwrap_or_else(|| file_stem(Path::new(&view.meta.source)));
    let dir = jpath.parent().unwrap_or_else(|| Path::new("."));
    let path = aggregate_path(dir, &stem);
    write_aggregate(&path, &aggregate)?;

    if !retain && !aggregate.meta.partial {
        if let Err(e) = std::fs::remove_file(jpath) {
            warn!(path = %jpath.display(), error = %e, "could not delete journal");
        }
    }
    Ok((aggregate, path))
}
