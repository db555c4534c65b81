//! Predefined line-range files.
//!
//! A range file is a human-editable text file co-located with its source,
//! named `<stem>_line_ranges.txt`, holding one `start-end` pair per line.
//! Blank lines and `#` comments are ignored. An empty file is treated as
//! missing.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;

use crate::core::{Chunk, LineRange};
use crate::error::{ChunkingError, Result};
use crate::io::{self, SourceText};

/// Suffix appended to the source stem for the range file.
const RANGE_FILE_SUFFIX: &str = "_line_ranges.txt";

// Pattern is a compile-time constant
#[allow(clippy::unwrap_used)]
static RANGE_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(\d+)\s*-\s*(\d+)\s*$").unwrap());

/// Returns the range-file path for a source file.
#[must_use]
pub fn line_ranges_path(source_path: &Path) -> PathBuf {
    let stem = source_path
        .file_stem()
        .map_or_else(String::new, |s| s.to_string_lossy().to_string());
    source_path.with_file_name(format!("{stem}{RANGE_FILE_SUFFIX}"))
}

/// Loads and validates the range file for a source file.
///
/// Returns `None` when the file is missing or empty (the caller decides
/// whether that is an error for its strategy).
///
/// # Errors
///
/// Returns a [`ChunkingError`] for unparseable lines, malformed pairs,
/// or unsorted/overlapping ranges.
pub fn load_line_ranges(source_path: &Path) -> Result<Option<Vec<LineRange>>> {
    let path = line_ranges_path(source_path);
    if !path.exists() {
        return Ok(None);
    }

    let raw = io::read_file(&path)?;
    let mut ranges = Vec::new();

    for (line_number, line) in raw.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let captures = RANGE_LINE
            .captures(trimmed)
            .ok_or_else(|| ChunkingError::InvalidRange {
                line: line_number + 1,
                text: trimmed.to_string(),
            })?;
        let start: usize = captures[1].parse().map_err(|_| ChunkingError::InvalidRange {
            line: line_number + 1,
            text: trimmed.to_string(),
        })?;
        let end: usize = captures[2].parse().map_err(|_| ChunkingError::InvalidRange {
            line: line_number + 1,
            text: trimmed.to_string(),
        })?;

        let range = LineRange::new(start, end);
        if !range.is_valid() {
            return Err(ChunkingError::InvalidRange {
                line: line_number + 1,
                text: trimmed.to_string(),
            }
            .into());
        }
        ranges.push(range);
    }

    if ranges.is_empty() {
        return Ok(None);
    }

    for pair in ranges.windows(2) {
        if pair[1].start <= pair[0].end {
            return Err(ChunkingError::OverlappingRanges {
                first_start: pair[0].start,
                first_end: pair[0].end,
                second_start: pair[1].start,
                second_end: pair[1].end,
            }
            .into());
        }
    }

    Ok(Some(ranges))
}

/// Persists ranges to the source's range file, sorted, one pair per line.
///
/// # Errors
///
/// Returns an error when the write fails.
pub fn save_line_ranges(source_path: &Path, ranges: &[LineRange]) -> Result<()> {
    let mut sorted: Vec<LineRange> = ranges.to_vec();
    sorted.sort();
    let mut content = String::new();
    for range in &sorted {
        content.push_str(&range.to_string());
        content.push('\n');
    }
    io::atomic_write_file(line_ranges_path(source_path), &content)
}

/// Builds chunks from predefined ranges, bounds-checked against the source.
///
/// # Errors
///
/// Returns [`ChunkingError::RangeOutOfBounds`] when a range exceeds the
/// file.
pub fn chunks_from_ranges(source: &SourceText, ranges: &[LineRange]) -> Result<Vec<Chunk>> {
    for range in ranges {
        if range.end > source.line_count() {
            return Err(ChunkingError::RangeOutOfBounds {
                start: range.start,
                end: range.end,
                line_count: source.line_count(),
            }
            .into());
        }
    }
    super::auto::chunks_for_ranges(source, ranges)
}
