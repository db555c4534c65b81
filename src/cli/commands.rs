//! CLI command implementations.
//!
//! Contains the business logic for each CLI command. Commands build
//! their configuration from global and per-command flags, wire up the
//! shared run state (schema registry, provider, ledger), and return a
//! formatted output string for `main` to print.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::batch::{BatchManager, PollOutcome, RepairContext, RepairOutcome, create_backend, repair_file};
use crate::chunking::{
    BoundaryRefiner, ChunkStrategy, TokenBudgetChunker, load_line_ranges, save_line_ranges,
};
use crate::cli::output::{
    OutputFormat, format_poll_outcomes, format_refinement, format_repairs, format_reports,
};
use crate::cli::parser::{Cli, Commands};
use crate::config::{Config, RefinementConfig};
use crate::context::ContextSource;
use crate::core::CancelToken;
use crate::error::{ChunkingError, CommandError, Error, ProviderError, Result};
use crate::extract::processor::finalize_journal;
use crate::extract::{FileProcessor, FileReport, read_journal};
use crate::io::SourceText;
use crate::provider::{Provider, ProviderKind, create_provider};
use crate::schema::SchemaRegistry;
use crate::tokens::DailyLedger;

/// Result of one command: output text plus whether the run was partial.
#[derive(Debug)]
pub struct ExecuteOutcome {
    /// Formatted output for stdout.
    pub output: String,
    /// True when some files or chunks failed while others succeeded.
    pub partial: bool,
}

impl ExecuteOutcome {
    fn complete(output: String) -> Self {
        Self {
            output,
            partial: false,
        }
    }
}

/// Executes the parsed CLI command.
///
/// # Errors
///
/// Returns an error when the command fails outright; partial completion
/// is reported through [`ExecuteOutcome::partial`] instead.
pub async fn execute(cli: &Cli, cancel: CancelToken) -> Result<ExecuteOutcome> {
    let format = OutputFormat::parse(&cli.format);

    match &cli.command {
        Commands::Process {
            schema,
            input,
            chunking,
            batch,
            context,
            context_source,
            tokens,
            concurrency,
            daily_token_limit,
            no_wait,
            retain_journal,
        } => {
            let mut builder = Config::builder()
                .model(&cli.model)
                .schema_dir(&cli.schema_dir)
                .output_dir(&cli.output_dir)
                .tokens_per_chunk(*tokens)
                .concurrency_limit(*concurrency)
                .no_wait(*no_wait)
                .retain_temporary_jsonl(*retain_journal);
            if let Some(provider) = &cli.provider {
                builder = builder.provider_override(provider);
            }
            if let Some(limit) = daily_token_limit {
                builder = builder.daily_token_limit(*limit);
            }
            let config = builder.from_env().build()?;
            let strategy = ChunkStrategy::parse(chunking)?;
            let source = ContextSource::parse(context_source).ok_or_else(|| {
                Error::from(CommandError::InvalidArgument(format!(
                    "unknown context source: {context_source}"
                )))
            })?;
            cmd_process(&config, schema, input, strategy, *batch, *context, source, format, cancel)
                .await
        }
        Commands::GenerateLineRanges { input, tokens } => {
            let config = base_config(cli)?;
            cmd_generate_line_ranges(&config, input, *tokens)
        }
        Commands::ReadjustLineRanges {
            schema,
            path,
            context_window,
            dry_run,
            boundary_type,
        } => {
            let config = base_config(cli)?;
            cmd_readjust_line_ranges(
                &config,
                schema,
                path,
                *context_window,
                *dry_run,
                boundary_type,
                format,
                cancel,
            )
            .await
        }
        Commands::CheckBatches { schema } => {
            let config = base_config(cli)?;
            cmd_check_batches(&config, schema.as_deref(), format).await
        }
        Commands::CancelBatches { force } => {
            let config = base_config(cli)?;
            cmd_cancel_batches(&config, *force, format).await
        }
        Commands::RepairExtractions {
            schema,
            files,
            force,
        } => {
            let config = base_config(cli)?;
            cmd_repair_extractions(&config, schema, files, *force, format, cancel).await
        }
    }
}

/// Builds configuration from the global flags alone.
fn base_config(cli: &Cli) -> Result<Config> {
    let mut builder = Config::builder()
        .model(&cli.model)
        .schema_dir(&cli.schema_dir)
        .output_dir(&cli.output_dir);
    if let Some(provider) = &cli.provider {
        builder = builder.provider_override(provider);
    }
    builder.from_env().build()
}

#[allow(clippy::too_many_arguments)]
async fn cmd_process(
    config: &Config,
    schema_name: &str,
    input: &Path,
    strategy: ChunkStrategy,
    batch: bool,
    context_enabled: bool,
    context_source: ContextSource,
    format: OutputFormat,
    cancel: CancelToken,
) -> Result<ExecuteOutcome> {
    let registry = SchemaRegistry::load(&config.schema_dir)?;
    registry.get(schema_name)?;
    let provider = create_provider(
        &config.model,
        config.provider_override.as_deref(),
        config.timeout,
    )?;
    let ledger = Arc::new(DailyLedger::open(
        config.ledger_path(),
        config.daily_token_limit,
    ));

    let inputs = collect_inputs(input)?;
    info!(files = inputs.len(), schema = schema_name, "starting run");

    let processor = FileProcessor::new(config, &registry, provider, ledger, cancel.clone());
    let mut reports: Vec<FileReport> = Vec::new();
    let mut failed_files = 0usize;

    // Files run sequentially: the ledger is a shared budget, and
    // chunk-level parallelism already saturates the provider.
    for file in &inputs {
        if cancel.is_cancelled() {
            warn!("run cancelled, stopping before remaining files");
            break;
        }
        match processor
            .process_file(file, schema_name, strategy, batch, context_enabled, context_source)
            .await
        {
            Ok(report) => reports.push(report),
            Err(e) if is_run_fatal(&e) => return Err(e),
            Err(e) => {
                error!(file = %file.display(), error = %e, "file failed");
                failed_files += 1;
            }
        }
    }

    info!(
        files = reports.len(),
        failed_files,
        succeeded = reports.iter().map(|r| r.succeeded).sum::<usize>(),
        failed = reports.iter().map(|r| r.failed).sum::<usize>(),
        total_tokens = reports.iter().map(|r| r.usage.total()).sum::<u64>(),
        "run finished"
    );

    let partial =
        failed_files > 0 || reports.iter().any(|r| r.partial) || reports.len() < inputs.len();
    let mut output = format_reports(&reports, format);
    if failed_files > 0 && format == OutputFormat::Text {
        output.push_str(&format!("{failed_files} file(s) failed; see log.\n"));
    }
    Ok(ExecuteOutcome { output, partial })
}

/// Errors that abort the whole run instead of one file.
const fn is_run_fatal(error: &Error) -> bool {
    matches!(
        error,
        Error::Config { .. }
            | Error::Provider(
                ProviderError::AuthMissing { .. } | ProviderError::AuthInvalid { .. }
            )
            | Error::Ledger(_)
    )
}

fn cmd_generate_line_ranges(
    config: &Config,
    input: &Path,
    tokens: usize,
) -> Result<ExecuteOutcome> {
    let chunker = TokenBudgetChunker::new(tokens, &config.model)?;
    let mut lines = String::new();

    for file in collect_inputs(input)? {
        let source = SourceText::load(&file)?;
        let ranges = chunker.plan(&source);
        save_line_ranges(&file, &ranges)?;
        lines.push_str(&format!(
            "{}: {} range(s) written\n",
            file.display(),
            ranges.len()
        ));
    }
    Ok(ExecuteOutcome::complete(lines))
}

#[allow(clippy::too_many_arguments)]
async fn cmd_readjust_line_ranges(
    config: &Config,
    schema_name: &str,
    path: &Path,
    context_window: usize,
    dry_run: bool,
    boundary_type: &str,
    format: OutputFormat,
    cancel: CancelToken,
) -> Result<ExecuteOutcome> {
    let registry = SchemaRegistry::load(&config.schema_dir)?;
    registry.get(schema_name)?;
    let provider = create_provider(
        &config.model,
        config.provider_override.as_deref(),
        config.timeout,
    )?;
    let ledger = DailyLedger::open(config.ledger_path(), config.daily_token_limit);

    let source = SourceText::load(path)?;
    let ranges = load_line_ranges(path)?.ok_or_else(|| {
        Error::from(ChunkingError::MissingLineRanges {
            path: path.to_string_lossy().to_string(),
        })
    })?;

    let refinement = RefinementConfig {
        window_lines: context_window,
        ..config.refinement.clone()
    };
    let refiner = BoundaryRefiner::new(
        &*provider,
        &ledger,
        config.model.as_str(),
        schema_name,
        refinement,
    )
    .with_boundary_type(boundary_type)
    .with_no_wait(config.no_wait)
    .with_cancel(cancel);

    let report = refiner.refine(&source, &ranges).await?;
    if !dry_run && report.changed() {
        save_line_ranges(path, &report.ranges)?;
    }
    Ok(ExecuteOutcome::complete(format_refinement(
        &report, dry_run, format,
    )))
}

async fn cmd_check_batches(
    config: &Config,
    schema: Option<&str>,
    format: OutputFormat,
) -> Result<ExecuteOutcome> {
    let ledger = Arc::new(DailyLedger::open(
        config.ledger_path(),
        config.daily_token_limit,
    ));
    let mut results: Vec<(String, Vec<PollOutcome>)> = Vec::new();
    let mut partial = false;

    for journal in find_journals(config, schema)? {
        let Some(stem) = crate::extract::stem_from_journal_path(&journal) else {
            continue;
        };
        let view = read_journal(&journal)?;
        let open = view.open_batches();
        if open.is_empty() {
            continue;
        }
        let Some(kind) = open
            .first()
            .and_then(|record| ProviderKind::parse(&record.provider))
        else {
            warn!(stem = stem.as_str(), "unknown provider tag in batch record");
            partial = true;
            continue;
        };

        let manager = match create_backend(kind, config.timeout) {
            Ok(backend) => BatchManager::new(backend, Arc::clone(&ledger)),
            Err(e) => {
                warn!(stem = stem.as_str(), error = %e, "cannot reach batch API");
                partial = true;
                continue;
            }
        };

        let outcomes = manager.poll_journal(&journal).await?;
        let refreshed = read_journal(&journal)?;
        if refreshed.is_complete() {
            finalize_journal(&journal, config.retain_temporary_jsonl)?;
            info!(stem = stem.as_str(), "batch results aggregated");
        }
        results.push((stem, outcomes));
    }

    Ok(ExecuteOutcome {
        output: format_poll_outcomes(&results, format),
        partial,
    })
}

async fn cmd_cancel_batches(
    config: &Config,
    force: bool,
    format: OutputFormat,
) -> Result<ExecuteOutcome> {
    #[derive(serde::Serialize)]
    struct CancelRow {
        batch_id: String,
        provider: String,
        status: String,
        cancelled: bool,
    }

    let ledger = Arc::new(DailyLedger::open(
        config.ledger_path(),
        config.daily_token_limit,
    ));
    let mut rows: Vec<CancelRow> = Vec::new();

    for journal in find_journals(config, None)? {
        let view = read_journal(&journal)?;
        let open: Vec<_> = view.open_batches().into_iter().cloned().collect();
        if open.is_empty() {
            continue;
        }

        if force {
            let Some(kind) = ProviderKind::parse(&open[0].provider) else {
                continue;
            };
            let manager =
                BatchManager::new(create_backend(kind, config.timeout)?, Arc::clone(&ledger));
            for (batch_id, status) in manager.cancel_journal(&journal).await? {
                rows.push(CancelRow {
                    batch_id,
                    provider: open[0].provider.clone(),
                    status: status.to_string(),
                    cancelled: true,
                });
            }
        } else {
            for record in &open {
                rows.push(CancelRow {
                    batch_id: record.batch_id.clone(),
                    provider: record.provider.clone(),
                    status: record.status.to_string(),
                    cancelled: false,
                });
            }
        }
    }

    let output = match format {
        OutputFormat::Json => serde_json::to_string_pretty(&rows).unwrap_or_default(),
        OutputFormat::Text => {
            if rows.is_empty() {
                "No open batches.\n".to_string()
            } else {
                let mut lines = String::new();
                for row in &rows {
                    if row.cancelled {
                        lines.push_str(&format!("{}: {}\n", row.batch_id, row.status));
                    } else {
                        lines.push_str(&format!(
                            "{} ({}, {}) -- use --force to cancel\n",
                            row.batch_id, row.provider, row.status
                        ));
                    }
                }
                lines
            }
        }
    };
    Ok(ExecuteOutcome::complete(output))
}

async fn cmd_repair_extractions(
    config: &Config,
    schema_name: &str,
    files: &[String],
    force: bool,
    format: OutputFormat,
    cancel: CancelToken,
) -> Result<ExecuteOutcome> {
    let registry = SchemaRegistry::load(&config.schema_dir)?;
    registry.get(schema_name)?;
    let provider: Arc<dyn Provider> = create_provider(
        &config.model,
        config.provider_override.as_deref(),
        config.timeout,
    )?;
    let ledger = Arc::new(DailyLedger::open(
        config.ledger_path(),
        config.daily_token_limit,
    ));

    let kind = ProviderKind::detect(&config.model, config.provider_override.as_deref())?;
    let manager = create_backend(kind, config.timeout)
        .ok()
        .map(|backend| BatchManager::new(backend, Arc::clone(&ledger)));

    let ctx = RepairContext {
        config,
        registry: &registry,
        provider,
        ledger,
        manager,
        force,
        cancel,
    };

    let mut outcomes: Vec<RepairOutcome> = Vec::new();
    for journal in find_journals(config, Some(schema_name))? {
        if !files.is_empty() {
            let stem = crate::extract::stem_from_journal_path(&journal).unwrap_or_default();
            if !files.iter().any(|f| *f == stem) {
                continue;
            }
        }
        outcomes.push(repair_file(&ctx, &journal).await?);
    }

    let partial = outcomes.iter().any(|o| !o.complete);
    Ok(ExecuteOutcome {
        output: format_repairs(&outcomes, format),
        partial,
    })
}

/// Collects input files: the file itself, or the `.txt` files directly
/// under a directory (sorted, skipping range and context companions).
fn collect_inputs(input: &Path) -> Result<Vec<PathBuf>> {
    if input.is_file() {
        return Ok(vec![input.to_path_buf()]);
    }
    if !input.is_dir() {
        return Err(CommandError::NoInputs {
            path: input.to_string_lossy().to_string(),
        }
        .into());
    }

    let mut files: Vec<PathBuf> = std::fs::read_dir(input)
        .map_err(|e| CommandError::ExecutionFailed(format!("cannot read directory: {e}")))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.is_file()
                && path.extension().is_some_and(|ext| ext == "txt")
                && path.file_name().is_some_and(|name| {
                    let name = name.to_string_lossy();
                    !name.ends_with("_line_ranges.txt") && !name.ends_with("_context.txt")
                })
        })
        .collect();
    files.sort();

    if files.is_empty() {
        return Err(CommandError::NoInputs {
            path: input.to_string_lossy().to_string(),
        }
        .into());
    }
    Ok(files)
}

/// Finds journal files under the output tree, optionally restricted to
/// one schema's directory.
fn find_journals(config: &Config, schema: Option<&str>) -> Result<Vec<PathBuf>> {
    let dirs: Vec<PathBuf> = match schema {
        Some(name) => vec![config.schema_output_dir(name)],
        None => {
            if !config.output_dir.is_dir() {
                return Ok(Vec::new());
            }
            std::fs::read_dir(&config.output_dir)
                .map_err(|e| {
                    CommandError::ExecutionFailed(format!("cannot read output directory: {e}"))
                })?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|path| path.is_dir())
                .collect()
        }
    };

    let mut journals = Vec::new();
    for dir in dirs {
        if !dir.is_dir() {
            continue;
        }
        let entries = std::fs::read_dir(&dir).map_err(|e| {
            CommandError::ExecutionFailed(format!("cannot read {}: {e}", dir.display()))
        })?;
        for entry in entries.filter_map(|entry| entry.ok().map(|e| e.path())) {
            if crate::extract::stem_from_journal_path(&entry).is_some() {
                journals.push(entry);
            }
        }
    }
    journals.sort();
    Ok(journals)
}
