//! Command-line argument parsing.
//!
//! Defines the CLI structure using clap derive macros.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Schema-driven structured extraction from large text files.
///
/// Segments input files into token-bounded chunks, dispatches each chunk
/// to an LLM provider for structured output, and aggregates the
/// responses into one dataset per file.
#[derive(Parser, Debug)]
#[command(name = "chronominer")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Directory scanned for schema files.
    #[arg(long, env = "CHRONOMINER_SCHEMA_DIR", default_value = "schemas", global = true)]
    pub schema_dir: PathBuf,

    /// Root directory for aggregates, journals, and ledger state.
    #[arg(long, env = "CHRONOMINER_OUTPUT_DIR", default_value = "output", global = true)]
    pub output_dir: PathBuf,

    /// Target model name.
    #[arg(short, long, env = "CHRONOMINER_MODEL", default_value = "gpt-4o-mini", global = true)]
    pub model: String,

    /// Provider tag override (openai, anthropic, google, openrouter).
    ///
    /// Normally detected from the model name.
    #[arg(long, env = "CHRONOMINER_PROVIDER", global = true)]
    pub provider: Option<String>,

    /// Enable verbose (debug-level) logging.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Only log errors.
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Output format (text, json).
    #[arg(long, default_value = "text", global = true)]
    pub format: String,

    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Extract structured records from a file or directory.
    Process {
        /// Schema name from the schema directory.
        #[arg(short, long)]
        schema: String,

        /// Input file or directory of `.txt` files.
        input: PathBuf,

        /// Chunking strategy (auto, auto-adjust, line-ranges,
        /// adjust-line-ranges, per-file).
        #[arg(short, long, default_value = "auto")]
        chunking: String,

        /// Submit one asynchronous batch per file instead of calling
        /// synchronously.
        #[arg(short, long)]
        batch: bool,

        /// Inject the context bundle into every prompt.
        #[arg(long)]
        context: bool,

        /// Where context comes from (default, file).
        #[arg(long, default_value = "default")]
        context_source: String,

        /// Token budget per chunk for automatic chunking.
        #[arg(long, default_value = "10000")]
        tokens: usize,

        /// Maximum concurrent chunk requests.
        #[arg(long, default_value = "10")]
        concurrency: usize,

        /// Daily token budget; omit to disable enforcement.
        #[arg(long, env = "CHRONOMINER_DAILY_TOKEN_LIMIT")]
        daily_token_limit: Option<u64>,

        /// Abort instead of waiting for midnight when the daily budget
        /// is exhausted.
        #[arg(long)]
        no_wait: bool,

        /// Keep the per-file journal after a successful aggregate write.
        #[arg(long)]
        retain_journal: bool,
    },

    /// Write a line-range file for an input under a token budget.
    GenerateLineRanges {
        /// Input file or directory of `.txt` files.
        input: PathBuf,

        /// Token budget per range.
        #[arg(long, default_value = "10000")]
        tokens: usize,
    },

    /// Refine an existing line-range file against semantic markers.
    ReadjustLineRanges {
        /// Schema name (drives the relevance probe).
        #[arg(short, long)]
        schema: String,

        /// Input file whose line ranges are refined.
        path: PathBuf,

        /// Lines of context on each side of a boundary.
        #[arg(long, default_value = "300")]
        context_window: usize,

        /// Report decisions without rewriting the range file.
        #[arg(long)]
        dry_run: bool,

        /// Marker kind the model should look for.
        #[arg(long, default_value = "entry beginning")]
        boundary_type: String,
    },

    /// Poll open batches, downloading and ingesting completed results.
    CheckBatches {
        /// Restrict to one schema's output directory.
        #[arg(short, long)]
        schema: Option<String>,
    },

    /// Cancel open batches.
    CancelBatches {
        /// Actually cancel; without this flag open batches are only
        /// listed.
        #[arg(short, long)]
        force: bool,
    },

    /// Re-poll unfinished batches and re-queue uncovered chunks.
    RepairExtractions {
        /// Schema name whose output directory is repaired.
        #[arg(short, long)]
        schema: String,

        /// Restrict to these file stems.
        #[arg(long, value_delimiter = ',')]
        files: Vec<String>,

        /// Also re-submit chunks that failed permanently.
        #[arg(short, long)]
        force: bool,
    },
}
