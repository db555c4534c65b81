//! Chunk and line-range representations.
//!
//! A chunk is a contiguous, 1-based inclusive line range of a source file
//! treated as one request unit. Chunks are created by a chunking strategy,
//! optionally adjusted by boundary refinement, and correlated with provider
//! responses through a stable `custom_id`.

use serde::{Deserialize, Serialize};
use unicode_segmentation::UnicodeSegmentation;

/// A contiguous range of source lines, 1-based and inclusive on both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LineRange {
    /// First line of the range.
    pub start: usize,
    /// Last line of the range.
    pub end: usize,
}

impl LineRange {
    /// Creates a range. Callers must uphold `1 <= start <= end`.
    #[must_use]
    pub const fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    /// Number of lines covered.
    #[must_use]
    pub const fn line_count(&self) -> usize {
        self.end - self.start + 1
    }

    /// Whether `line` falls inside the range.
    #[must_use]
    pub const fn contains(&self, line: usize) -> bool {
        line >= self.start && line <= self.end
    }

    /// Whether this range shares any line with `other`.
    #[must_use]
    pub const fn overlaps(&self, other: &Self) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    /// Whether the range is well-formed (`1 <= start <= end`).
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.start >= 1 && self.start <= self.end
    }
}

impl std::fmt::Display for LineRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// One request unit: a line range of the source plus its extracted text.
///
/// Chunk indices are 1-based and strictly increasing within a file. Two
/// chunks of the same file never share an index; refinement may widen the
/// gap between consecutive ranges by deleting an empty range, but never
/// reorders them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// 1-based position within the file's chunk sequence.
    pub index: usize,
    /// Source lines covered by this chunk.
    pub range: LineRange,
    /// The covered lines, newline-joined.
    pub text: String,
}

impl Chunk {
    /// Creates a chunk.
    #[must_use]
    pub const fn new(index: usize, range: LineRange, text: String) -> Self {
        Self { index, range, text }
    }

    /// Returns the stable request identifier for this chunk of `file_stem`.
    #[must_use]
    pub fn custom_id(&self, file_stem: &str) -> String {
        custom_id(file_stem, self.index)
    }

    /// Size of the chunk text in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.text.len()
    }

    /// Whether the chunk has no text.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    /// Returns a preview of the chunk text, truncated on a grapheme boundary.
    #[must_use]
    pub fn preview(&self, max_graphemes: usize) -> String {
        let mut preview: String = self
            .text
            .graphemes(true)
            .take(max_graphemes)
            .collect::<String>()
            .replace('\n', "\\n");
        if self.text.graphemes(true).count() > max_graphemes {
            preview.push('…');
        }
        preview
    }
}

/// Builds the stable request identifier `{file_stem}-chunk-{chunk_index}`.
///
/// The identifier is stable across retries and batch submissions and is the
/// correlation key between journal records and provider responses.
#[must_use]
pub fn custom_id(file_stem: &str, chunk_index: usize) -> String {
    format!("{file_stem}-chunk-{chunk_index}")
}

/// Splits a `custom_id` back into `(file_stem, chunk_index)`.
///
/// Splits on the last `-chunk-` marker so file stems containing the marker
/// themselves still round-trip.
#[must_use]
pub fn parse_custom_id(id: &str) -> Option<(&str, usize)> {
    let pos = id.rfind("-chunk-")?;
    let stem = &id[..pos];
    let index: usize = id[pos + "-chunk-".len()..].parse().ok()?;
    if stem.is_empty() || index == 0 {
        return None;
    }
    Some((stem, index))
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn test_line_range_basics() {
        let range = LineRange::new(10, 20);
        assert_eq!(range.line_count(), 11);
        assert!(range.contains(10));
        assert!(range.contains(20));
        assert!(!range.contains(21));
        assert!(range.is_valid());
        assert_eq!(range.to_string(), "10-20");
    }

    #[test]
    fn test_line_range_single_line() {
        let range = LineRange::new(5, 5);
        assert_eq!(range.line_count(), 1);
        assert!(range.is_valid());
    }

    #[test]
    fn test_line_range_invalid() {
        assert!(!LineRange::new(0, 5).is_valid());
        assert!(!LineRange::new(7, 3).is_valid());
    }

    #[test_case(LineRange::new(1, 10), LineRange::new(10, 20), true; "touching")]
    #[test_case(LineRange::new(1, 9), LineRange::new(10, 20), false; "adjacent")]
    #[test_case(LineRange::new(5, 15), LineRange::new(10, 12), true; "nested")]
    #[test_case(LineRange::new(1, 3), LineRange::new(7, 9), false; "disjoint")]
    fn test_line_range_overlaps(a: LineRange, b: LineRange, expected: bool) {
        assert_eq!(a.overlaps(&b), expected);
        assert_eq!(b.overlaps(&a), expected);
    }

    #[test]
    fn test_custom_id_format() {
        assert_eq!(custom_id("diary_1898", 3), "diary_1898-chunk-3");
    }

    #[test]
    fn test_parse_custom_id_round_trip() {
        let id = custom_id("ledger-chunk-notes", 12);
        let (stem, index) = parse_custom_id(&id).unwrap_or(("", 0));
        assert_eq!(stem, "ledger-chunk-notes");
        assert_eq!(index, 12);
    }

    #[test]
    fn test_parse_custom_id_rejects_garbage() {
        assert!(parse_custom_id("no-marker-here").is_none());
        assert!(parse_custom_id("-chunk-4").is_none());
        assert!(parse_custom_id("stem-chunk-zero").is_none());
        assert!(parse_custom_id("stem-chunk-0").is_none());
    }

    #[test]
    fn test_chunk_custom_id() {
        let chunk = Chunk::new(2, LineRange::new(101, 200), "text".to_string());
        assert_eq!(chunk.custom_id("report"), "report-chunk-2");
    }

    #[test]
    fn test_chunk_preview_truncates() {
        let chunk = Chunk::new(1, LineRange::new(1, 2), "héllo\nwörld".to_string());
        let preview = chunk.preview(7);
        assert!(preview.starts_with("héllo\\nw"));
        assert!(preview.ends_with('…'));
        assert_eq!(chunk.preview(100), "héllo\\nwörld");
    }

    #[test]
    fn test_chunk_size_and_empty() {
        let chunk = Chunk::new(1, LineRange::new(1, 1), String::new());
        assert!(chunk.is_empty());
        assert_eq!(chunk.size(), 0);
    }

    #[test]
    fn test_chunk_serialization() {
        let chunk = Chunk::new(1, LineRange::new(1, 3), "a\nb\nc".to_string());
        let json = serde_json::to_string(&chunk).unwrap_or_default();
        let back: Chunk = serde_json::from_str(&json).unwrap_or_else(|_| unreachable!());
        assert_eq!(back, chunk);
    }
}
