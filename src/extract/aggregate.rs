//! Per-file aggregation of journaled chunk responses.
//!
//! The aggregate is a pure function of the journal: responses are sorted
//! by chunk index, successful outputs are parsed into their structured
//! objects, and anything that is not a top-level object is preserved
//! verbatim under an error key. A missing index marks the aggregate
//! partial but never fails the file.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use super::journal::{ChunkOutcome, JournalView};
use crate::core::TokenUsage;
use crate::error::Result;
use crate::io;

/// File-level aggregate metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateMeta {
    /// Source file path.
    pub file: String,
    /// Schema name.
    pub schema: String,
    /// Target model.
    pub model: String,
    /// Expected number of chunks.
    pub chunk_count: usize,
    /// RFC 3339 generation timestamp.
    pub generated_at: String,
    /// Set when any expected chunk is missing or failed.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub partial: bool,
}

/// One chunk's contribution to the aggregate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateChunk {
    /// 1-based chunk index.
    pub chunk_index: usize,
    /// Stable request identifier.
    pub custom_id: String,
    /// Parsed structured response, when the chunk succeeded.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub response: Option<Value>,
    /// Failure description or non-conforming response, verbatim.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
    /// Token usage for the chunk, when recorded.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub usage: Option<TokenUsage>,
}

/// The per-file dataset written as `<stem>.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Aggregate {
    /// File-level metadata.
    pub meta: AggregateMeta,
    /// Chunk responses ordered by `chunk_index`.
    pub chunks: Vec<AggregateChunk>,
}

impl Aggregate {
    /// Whether every expected chunk contributed a structured response.
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        !self.meta.partial
    }
}

/// Returns the aggregate path for a file stem under `dir`.
#[must_use]
pub fn aggregate_path(dir: &Path, file_stem: &str) -> PathBuf {
    dir.join(format!("{file_stem}.json"))
}

/// Builds the aggregate from a replayed journal.
#[must_use]
pub fn build_aggregate(view: &JournalView) -> Aggregate {
    let mut chunks = Vec::with_capacity(view.chunks.len());
    let mut any_error = false;

    for record in view.chunks.values() {
        let (response, error) = match &record.response {
            ChunkOutcome::Success { output_text } => {
                match serde_json::from_str::<Value>(output_text) {
                    Ok(value) if value.is_object() => (Some(value), None),
                    // Preserve non-conforming output verbatim
                    _ => (None, Some(output_text.clone())),
                }
            }
            ChunkOutcome::Failure { error } => (None, Some(error.clone())),
        };
        if error.is_some() {
            any_error = true;
        }
        chunks.push(AggregateChunk {
            chunk_index: record.chunk_index,
            custom_id: record.custom_id.clone(),
            response,
            error,
            usage: record.usage,
        });
    }

    let missing = view.missing_indices();
    if !missing.is_empty() {
        warn!(
            file = %view.meta.source,
            missing = ?missing,
            "aggregate is missing chunks"
        );
    }

    Aggregate {
        meta: AggregateMeta {
            file: view.meta.source.clone(),
            schema: view.meta.schema.clone(),
            model: view.meta.model.clone(),
            chunk_count: view.meta.chunk_count,
            generated_at: chrono::Local::now().to_rfc3339(),
            partial: any_error || !missing.is_empty(),
        },
        chunks,
    }
}

/// Writes the aggregate as pretty-printed JSON via atomic rename.
///
/// # Errors
///
/// Returns an error when serialization or the write fails.
pub fn write_aggregate(path: &Path, aggregate: &Aggregate) -> Result<()> {
    let json = serde_json::to_string_pretty(aggregate)
        .map_err(crate::error::JournalError::from)?;
    io::atomic_write_file(path, &json)
}
