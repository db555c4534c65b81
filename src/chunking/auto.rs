//! Automatic token-budget chunking.
//!
//! Starting from line 1, lines are accumulated greedily until adding the
//! next line would exceed the configured per-chunk token budget, at which
//! point the chunk is emitted and accumulation restarts. Lines are never
//! split: a single line over the budget becomes its own chunk.

use tracing::debug;

use crate::core::{Chunk, LineRange};
use crate::error::{ChunkingError, Result};
use crate::io::SourceText;
use crate::tokens;

/// Greedy line-accumulating chunker under a token budget.
#[derive(Debug, Clone)]
pub struct TokenBudgetChunker {
    tokens_per_chunk: usize,
    model: String,
}

impl TokenBudgetChunker {
    /// Creates a chunker for `model` with the given per-chunk budget.
    ///
    /// # Errors
    ///
    /// Returns [`ChunkingError::InvalidConfig`] when the budget is zero.
    pub fn new(tokens_per_chunk: usize, model: impl Into<String>) -> Result<Self> {
        if tokens_per_chunk == 0 {
            return Err(ChunkingError::InvalidConfig {
                reason: "tokens_per_chunk must be > 0".to_string(),
            }
            .into());
        }
        Ok(Self {
            tokens_per_chunk,
            model: model.into(),
        })
    }

    /// Plans the line ranges for `source` without materializing chunk text.
    ///
    /// An empty file yields an empty plan. Consecutive ranges are
    /// contiguous: `ranges[i+1].start == ranges[i].end + 1`.
    #[must_use]
    pub fn plan(&self, source: &SourceText) -> Vec<LineRange> {
        if source.is_empty() {
            return Vec::new();
        }

        let lines: Vec<&str> = source.lines().collect();
        let line_tokens = tokens::count_lines(&lines, &self.model);

        let mut ranges = Vec::new();
        let mut start = 1;
        let mut accumulated = 0usize;

        for (offset, &line_count) in line_tokens.iter().enumerate() {
            let line_number = offset + 1;
            // The newline between accumulated lines costs roughly one token
            let cost = line_count + usize::from(line_number > start);

            if line_number > start && accumulated + cost > self.tokens_per_chunk {
                ranges.push(LineRange::new(start, line_number - 1));
                start = line_number;
                accumulated = line_count;
            } else {
                accumulated += cost;
            }
        }
        ranges.push(LineRange::new(start, line_tokens.len()));

        debug!(
            chunks = ranges.len(),
            lines = line_tokens.len(),
            budget = self.tokens_per_chunk,
            "planned automatic chunks"
        );
        ranges
    }

    /// Segments `source` into chunks with materialized text.
    ///
    /// # Errors
    ///
    /// Returns an error only when a planned range cannot be sliced, which
    /// would indicate a bookkeeping bug rather than bad input.
    pub fn chunk(&self, source: &SourceText) -> Result<Vec<Chunk>> {
        let ranges = self.plan(source);
        chunks_for_ranges(source, &ranges)
    }
}

/// Materializes chunk text for a sequence of planned ranges.
pub(crate) fn chunks_for_ranges(source: &SourceText, ranges: &[LineRange]) -> Result<Vec<Chunk>> {
    ranges
        .iter()
        .enumerate()
        .map(|(position, &range)| {
            let text = source.slice(range).ok_or_else(|| {
                crate::error::Error::from(ChunkingError::RangeOutOfBounds {
                    start: range.start,
                    end: range.end,
                    line_count: source.line_count(),
                })
            })?;
            Ok(Chunk::new(position + 1, range, text))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunking::validate_chunks;
    use proptest::prelude::*;

    const MODEL: &str = "gpt-4o-mini";

    fn source_of(lines: &[&str]) -> SourceText {
        SourceText::from_string(lines.join("\n"))
    }

    #[test]
    fn test_empty_file_yields_no_chunks() {
        let chunker = TokenBudgetChunker::new(100, MODEL).unwrap();
        let source = SourceText::from_string(String::new());
        assert!(chunker.chunk(&source).unwrap().is_empty());
    }

    #[test]
    fn test_zero_budget_rejected() {
        assert!(TokenBudgetChunker::new(0, MODEL).is_err());
    }

    #[test]
    fn test_small_file_single_chunk() {
        let chunker = TokenBudgetChunker::new(10_000, MODEL).unwrap();
        let source = source_of(&["first line", "second line", "third line"]);
        let chunks = chunker.chunk(&source).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].index, 1);
        assert_eq!(chunks[0].range, LineRange::new(1, 3));
        assert_eq!(chunks[0].text, "first line\nsecond line\nthird line");
    }

    #[test]
    fn test_budget_splits_into_multiple_chunks() {
        // Each line is well over 10 tokens, so a 20-token budget forces
        // frequent splits without ever splitting a line.
        let line = "alpha beta gamma delta epsilon zeta eta theta iota kappa";
        let lines: Vec<&str> = std::iter::repeat_n(line, 10).collect();
        let chunker = TokenBudgetChunker::new(20, MODEL).unwrap();
        let source = source_of(&lines);
        let chunks = chunker.chunk(&source).unwrap();

        assert!(chunks.len() > 1);
        validate_chunks(&chunks, source.line_count()).unwrap();
        // Contiguous coverage of the whole file
        assert_eq!(chunks[0].range.start, 1);
        assert_eq!(chunks.last().unwrap().range.end, source.line_count());
        for pair in chunks.windows(2) {
            assert_eq!(pair[1].range.start, pair[0].range.end + 1);
        }
    }

    #[test]
    fn test_oversized_line_is_its_own_chunk() {
        let huge = "word ".repeat(200);
        let lines = vec!["short", huge.as_str(), "short"];
        let chunker = TokenBudgetChunker::new(10, MODEL).unwrap();
        let source = source_of(&lines);
        let chunks = chunker.chunk(&source).unwrap();

        // The huge middle line must not be split across chunks
        let containing: Vec<_> = chunks
            .iter()
            .filter(|c| c.range.contains(2))
            .collect();
        assert_eq!(containing.len(), 1);
        assert_eq!(containing[0].range, LineRange::new(2, 2));
    }

    #[test]
    fn test_exact_budget_single_chunk() {
        let source = source_of(&["one two three"]);
        let budget = crate::tokens::count("one two three", MODEL);
        let chunker = TokenBudgetChunker::new(budget, MODEL).unwrap();
        let chunks = chunker.chunk(&source).unwrap();
        assert_eq!(chunks.len(), 1);
    }

    #[test]
    fn test_plan_matches_chunk_ranges() {
        let lines: Vec<String> = (0..50).map(|i| format!("entry number {i} with text")).collect();
        let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
        let chunker = TokenBudgetChunker::new(30, MODEL).unwrap();
        let source = source_of(&refs);
        let plan = chunker.plan(&source);
        let chunks = chunker.chunk(&source).unwrap();
        let chunk_ranges: Vec<LineRange> = chunks.iter().map(|c| c.range).collect();
        assert_eq!(plan, chunk_ranges);
    }

    proptest! {
        #[test]
        fn prop_chunks_cover_file_contiguously(
            line_lens in prop::collection::vec(0usize..120, 1..60),
            budget in 5usize..200,
        ) {
            let lines: Vec<String> = line_lens
                .iter()
                .map(|&n| "w ".repeat(n))
                .collect();
            let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
            let source = source_of(&refs);
            let chunker = TokenBudgetChunker::new(budget, MODEL).unwrap();
            let chunks = chunker.chunk(&source).unwrap();

            prop_assert!(!chunks.is_empty());
            prop_assert!(validate_chunks(&chunks, source.line_count()).is_ok());
            prop_assert_eq!(chunks[0].range.start, 1);
            prop_assert_eq!(chunks[chunks.len() - 1].range.end, source.line_count());
            for pair in chunks.windows(2) {
                prop_assert_eq!(pair[1].range.start, pair[0].range.end + 1);
            }
        }
    }
}
