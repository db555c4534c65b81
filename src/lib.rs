//! # ChronoMiner
//!
//! Schema-driven structured extraction from large text files.
//!
//! ChronoMiner segments unstructured text into token-bounded chunks,
//! dispatches each chunk to an LLM provider for structured output, and
//! aggregates the validated responses into one dataset per input file.
//!
//! ## Features
//!
//! - **Chunking**: automatic token-budget segmentation, human-editable
//!   line-range files, and LLM-refined semantic boundaries
//! - **Providers**: `OpenAI`, Anthropic, Google, and OpenRouter behind one
//!   structured-output interface with per-model capability filtering
//! - **Durability**: an append-only per-file journal drives aggregation,
//!   resume, and batch repair
//! - **Budgeting**: a persistent daily token ledger with midnight reset

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(missing_docs)]
// Note: unsafe is needed for memory-mapped I/O (memmap2)
#![warn(unsafe_code)]

pub mod batch;
pub mod chunking;
pub mod cli;
pub mod config;
pub mod context;
pub mod core;
pub mod error;
pub mod extract;
pub mod io;
pub mod provider;
pub mod schema;
pub mod tokens;

// Re-export commonly used types at crate root
pub use error::{Error, Result};

// Re-export core domain types
pub use core::{CancelHandle, CancelToken, Chunk, LineRange, TokenUsage, custom_id};

// Re-export configuration
pub use config::{Config, RefinementConfig};

// Re-export chunking types
pub use chunking::{
    BoundaryRefiner, ChunkStrategy, TokenBudgetChunker, available_strategies, validate_chunks,
};

// Re-export provider types
pub use provider::{
    InvokeRequest, InvokeResponse, ModelCapabilities, ModelParameters, Provider, ProviderKind,
    capabilities, create_provider, filter_parameters,
};

// Re-export pipeline types
pub use extract::{
    Aggregate, ChunkJob, FileProcessor, FileReport, JournalWriter, RetryPolicy, RunMode,
    Scheduler, build_aggregate, read_journal,
};

// Re-export batch types
pub use batch::{BatchManager, BatchStatus, create_backend, repair_file};

// Re-export ledger and schema registry
pub use schema::{SchemaDescriptor, SchemaRegistry};
pub use tokens::DailyLedger;

// Re-export CLI types
pub use cli::{Cli, Commands, OutputFormat};
