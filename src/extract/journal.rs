//! Append-only per-file result journal.
//!
//! The journal is the durable record of a file's run: one metadata header
//! line, then one JSON object per chunk response or batch-tracking event,
//! flushed per record. Everything downstream — the aggregate, resume, and
//! batch repair — is a pure function of this file. Readers tolerate
//! duplicate records for the same `custom_id` by keeping the last
//! occurrence, and skip unparseable lines rather than failing replay.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::batch::BatchStatus;
use crate::core::TokenUsage;
use crate::error::{JournalError, Result};
use crate::provider::ProviderKind;

/// Suffix of journal files next to the aggregate output.
const JOURNAL_SUFFIX: &str = "_temporary.jsonl";

/// Returns the journal path for a file stem under `dir`.
#[must_use]
pub fn journal_path(dir: &Path, file_stem: &str) -> PathBuf {
    dir.join(format!("{file_stem}{JOURNAL_SUFFIX}"))
}

/// Extracts the file stem from a journal path, when it is one.
#[must_use]
pub fn stem_from_journal_path(path: &Path) -> Option<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .and_then(|n| n.strip_suffix(JOURNAL_SUFFIX))
        .map(ToString::to_string)
}

/// File-level metadata, the journal's first line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalMeta {
    /// Source file path as given to the run.
    pub source: String,
    /// Schema name.
    pub schema: String,
    /// Target model.
    pub model: String,
    /// Number of chunks the run expects.
    pub chunk_count: usize,
    /// RFC 3339 creation timestamp.
    pub created_at: String,
}

/// Outcome of one chunk request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChunkOutcome {
    /// The provider returned a validated structured object.
    Success {
        /// Raw response text, exactly as returned.
        output_text: String,
    },
    /// The request failed permanently or the response failed validation.
    Failure {
        /// Error description; validation failures carry the raw response.
        error: String,
    },
}

impl ChunkOutcome {
    /// Whether this outcome is a success.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// One chunk response record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkRecord {
    /// Stable request identifier.
    pub custom_id: String,
    /// 1-based chunk index within the file.
    pub chunk_index: usize,
    /// Success or failure payload.
    pub response: ChunkOutcome,
    /// Token usage, present on successes.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub usage: Option<TokenUsage>,
    /// Model that served (or was asked to serve) the request.
    pub model: String,
    /// RFC 3339 completion timestamp.
    pub timestamp: String,
    /// Attempts spent on this chunk, including the successful one.
    #[serde(default = "default_attempts")]
    pub attempts: u32,
}

const fn default_attempts() -> u32 {
    1
}

/// One batch-tracking record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRecord {
    /// Provider batch identifier.
    pub batch_id: String,
    /// Provider tag.
    pub provider: String,
    /// RFC 3339 submission timestamp.
    pub submitted_at: String,
    /// Chunks covered by the batch.
    pub chunk_count: usize,
    /// Unified status at the time of the record.
    pub status: BatchStatus,
    /// Source file the batch belongs to.
    pub source_file: String,
}

impl BatchRecord {
    /// Builds a fresh tracking record in `submitted` state terms: the
    /// unified vocabulary starts batches at `validating`.
    #[must_use]
    pub fn submitted(
        batch_id: impl Into<String>,
        provider: ProviderKind,
        chunk_count: usize,
        source_file: impl Into<String>,
    ) -> Self {
        Self {
            batch_id: batch_id.into(),
            provider: provider.tag().to_string(),
            submitted_at: chrono::Local::now().to_rfc3339(),
            chunk_count,
            status: BatchStatus::Validating,
            source_file: source_file.into(),
        }
    }
}

/// One journal line.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JournalRecord {
    /// File-level metadata header.
    Meta(JournalMeta),
    /// Chunk response.
    Chunk(ChunkRecord),
    /// Batch-tracking event.
    Batch(BatchRecord),
}

/// Append-only journal writer with per-record flush.
#[derive(Debug)]
pub struct JournalWriter {
    path: PathBuf,
    file: Mutex<BufWriter<File>>,
}

impl JournalWriter {
    /// Creates a fresh journal, truncating any prior one, and writes the
    /// metadata header.
    ///
    /// # Errors
    ///
    /// Returns an error when the file cannot be created or the header
    /// cannot be written.
    pub fn create(path: impl Into<PathBuf>, meta: &JournalMeta) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).ok();
        }
        let file = File::create(&path).map_err(|e| JournalError::AppendFailed {
            path: path.to_string_lossy().to_string(),
            reason: e.to_string(),
        })?;
        let writer = Self {
            path,
            file: Mutex::new(BufWriter::new(file)),
        };
        writer.append(&JournalRecord::Meta(meta.clone()))?;
        Ok(writer)
    }

    /// Opens an existing journal for appending (batch ingest, repair).
    ///
    /// # Errors
    ///
    /// Returns an error when the file does not exist or cannot be opened.
    pub fn open_append(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = OpenOptions::new()
            .append(true)
            .open(&path)
            .map_err(|e| JournalError::AppendFailed {
                path: path.to_string_lossy().to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            path,
            file: Mutex::new(BufWriter::new(file)),
        })
    }

    /// The journal file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends a chunk response record.
    ///
    /// # Errors
    ///
    /// Returns an error when the write or flush fails.
    pub fn append_chunk(&self, record: &ChunkRecord) -> Result<()> {
        self.append(&JournalRecord::Chunk(record.clone()))
    }

    /// Appends a batch-tracking record.
    ///
    /// # Errors
    ///
    /// Returns an error when the write or flush fails.
    pub fn append_batch(&self, record: &BatchRecord) -> Result<()> {
        self.append(&JournalRecord::Batch(record.clone()))
    }

    fn append(&self, record: &JournalRecord) -> Result<()> {
        let line = serde_json::to_string(record).map_err(JournalError::from)?;
        let mut guard = self
            .file
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        writeln!(guard, "{line}").map_err(|e| JournalError::AppendFailed {
            path: self.path.to_string_lossy().to_string(),
            reason: e.to_string(),
        })?;
        guard.flush().map_err(|e| {
            JournalError::AppendFailed {
                path: self.path.to_string_lossy().to_string(),
                reason: e.to_string(),
            }
            .into()
        })
    }
}

/// Replayed view of a journal: header plus last-wins chunk and batch
/// state.
#[derive(Debug, Clone)]
pub struct JournalView {
    /// File-level metadata.
    pub meta: JournalMeta,
    /// Latest record per chunk index.
    pub chunks: BTreeMap<usize, ChunkRecord>,
    /// Latest record per batch id, in first-seen order.
    pub batches: Vec<BatchRecord>,
}

impl JournalView {
    /// Chunk indices in `1..=chunk_count` with no record at all.
    #[must_use]
    pub fn missing_indices(&self) -> Vec<usize> {
        (1..=self.meta.chunk_count)
            .filter(|i| !self.chunks.contains_key(i))
            .collect()
    }

    /// Whether every expected chunk has a record (success or failure).
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.missing_indices().is_empty()
    }

    /// Batches that have not reached a terminal state.
    #[must_use]
    pub fn open_batches(&self) -> Vec<&BatchRecord> {
        self.batches
            .iter()
            .filter(|b| !b.status.is_terminal())
            .collect()
    }
}

/// Replays a journal file into a view.
///
/// Unparseable lines are skipped with a warning; duplicate chunk or batch
/// records resolve to the last occurrence.
///
/// # Errors
///
/// Returns [`JournalError::MissingHeader`] when the first parseable
/// record is not a metadata header, and I/O errors when the file cannot
/// be read.
pub fn read_journal(path: &Path) -> Result<JournalView> {
    let raw = crate::io::read_file(path)?;

    let mut meta: Option<JournalMeta> = None;
    let mut chunks: BTreeMap<usize, ChunkRecord> = BTreeMap::new();
    let mut batches: Vec<BatchRecord> = Vec::new();

    for (line_number, line) in raw.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let record: JournalRecord = match serde_json::from_str(line) {
            Ok(record) => record,
            Err(e) => {
                warn!(
                    path = %path.display(),
                    line = line_number + 1,
                    error = %e,
                    "skipping malformed journal line"
                );
                continue;
            }
        };
        match record {
            JournalRecord::Meta(m) => {
                if meta.is_none() {
                    meta = Some(m);
                }
            }
            JournalRecord::Chunk(record) => {
                chunks.insert(record.chunk_index, record);
            }
            JournalRecord::Batch(record) => {
                if let Some(existing) =
                    batches.iter_mut().find(|b| b.batch_id == record.batch_id)
                {
                    *existing = record;
                } else {
                    batches.push(record);
                }
            }
        }
    }

    let meta = meta.ok_or_else(|| JournalError::MissingHeader {
        path: path.to_string_lossy().to_string(),
    })?;

    Ok(JournalView {
        meta,
        chunks,
        batches,
    })
}
