//! Chunking strategies for source files.
//!
//! This module segments a source file into token-bounded line ranges.
//! Three strategies are available:
//!
//! - **Automatic**: greedy line accumulation under a token budget
//! - **Line ranges**: a human-editable `start-end` file next to the source
//! - **Adjusted**: either of the above, refined against semantic markers
//!   by an LLM pass
//!
//! All strategies produce the same contract: a finite, strictly ordered
//! sequence of chunks whose ranges are sorted, non-overlapping, and inside
//! the file.

pub mod auto;
pub mod ranges;
pub mod refine;

pub use auto::TokenBudgetChunker;
pub use ranges::{chunks_from_ranges, line_ranges_path, load_line_ranges, save_line_ranges};
pub use refine::{BoundaryAction, BoundaryDecision, BoundaryRefiner, RefinementReport};

use crate::core::{Chunk, LineRange};
use crate::error::{ChunkingError, Result};

/// How a file is segmented into chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChunkStrategy {
    /// Greedy token-budget accumulation.
    #[default]
    Automatic,
    /// Automatic, then boundary refinement.
    AutomaticAdjusted,
    /// Predefined ranges from the co-located range file.
    LineRanges,
    /// Predefined ranges, then boundary refinement (re-persisted).
    LineRangesAdjusted,
    /// Per file: line ranges when a non-empty range file exists,
    /// automatic otherwise.
    PerFile,
}

impl ChunkStrategy {
    /// Parses a strategy name as given on the command line.
    ///
    /// # Errors
    ///
    /// Returns [`ChunkingError::UnknownStrategy`] for unrecognized names.
    pub fn parse(name: &str) -> Result<Self> {
        match name.to_lowercase().as_str() {
            "auto" | "automatic" => Ok(Self::Automatic),
            "auto-adjust" | "auto_adjust" => Ok(Self::AutomaticAdjusted),
            "line-ranges" | "line_ranges" => Ok(Self::LineRanges),
            "adjust-line-ranges" | "adjust_line_ranges" => Ok(Self::LineRangesAdjusted),
            "per-file" | "per_file" => Ok(Self::PerFile),
            _ => Err(ChunkingError::UnknownStrategy {
                name: name.to_string(),
            }
            .into()),
        }
    }

    /// Whether this strategy runs the refinement pass.
    #[must_use]
    pub const fn refines(&self) -> bool {
        matches!(self, Self::AutomaticAdjusted | Self::LineRangesAdjusted)
    }

    /// The canonical name, as accepted by [`ChunkStrategy::parse`].
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Automatic => "auto",
            Self::AutomaticAdjusted => "auto-adjust",
            Self::LineRanges => "line-ranges",
            Self::LineRangesAdjusted => "adjust-line-ranges",
            Self::PerFile => "per-file",
        }
    }
}

/// Lists available strategy names.
#[must_use]
pub fn available_strategies() -> Vec<&'static str> {
    vec![
        "auto",
        "auto-adjust",
        "line-ranges",
        "adjust-line-ranges",
        "per-file",
    ]
}

/// Validates the chunk-sequence contract shared by all strategies.
///
/// Checks 1-based contiguous indices, range validity, sortedness, and
/// non-overlap. Ranges need not be contiguous (refinement may delete an
/// empty range), but they must never go backwards.
///
/// # Errors
///
/// Returns a [`ChunkingError`] describing the first violated invariant.
pub fn validate_chunks(chunks: &[Chunk], line_count: usize) -> Result<()> {
    let mut previous: Option<&LineRange> = None;
    for (position, chunk) in chunks.iter().enumerate() {
        if chunk.index != position + 1 {
            return Err(ChunkingError::InvalidConfig {
                reason: format!(
                    "chunk at position {} has index {} (expected {})",
                    position,
                    chunk.index,
                    position + 1
                ),
            }
            .into());
        }
        if !chunk.range.is_valid() || chunk.range.end > line_count {
            return Err(ChunkingError::RangeOutOfBounds {
                start: chunk.range.start,
                end: chunk.range.end,
                line_count,
            }
            .into());
        }
        if let Some(prev) = previous {
            if prev.overlaps(&chunk.range) || chunk.range.start <= prev.end {
                return Err(ChunkingError::OverlappingRanges {
                    first_start: prev.start,
                    first_end: prev.end,
                    second_start: chunk.range.start,
                    second_end: chunk.range.end,
                }
                .into());
            }
        }
        previous = Some(&chunk.range);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("auto", ChunkStrategy::Automatic ; "auto_lower")]
    #[test_case("AUTO", ChunkStrategy::Automatic ; "auto_upper")]
    #[test_case("auto-adjust", ChunkStrategy::AutomaticAdjusted ; "auto_adjust")]
    #[test_case("line_ranges", ChunkStrategy::LineRanges ; "line_ranges_underscore")]
    #[test_case("line-ranges", ChunkStrategy::LineRanges ; "line_ranges_dash")]
    #[test_case("adjust-line-ranges", ChunkStrategy::LineRangesAdjusted ; "adjust_line_ranges")]
    #[test_case("per-file", ChunkStrategy::PerFile ; "per_file")]
    fn test_parse_strategy(name: &str, expected: ChunkStrategy) {
        assert_eq!(ChunkStrategy::parse(name).unwrap(), expected);
    }

    #[test]
    fn test_parse_unknown_strategy() {
        assert!(ChunkStrategy::parse("recursive").is_err());
    }

    #[test]
    fn test_strategy_name_round_trip() {
        for name in available_strategies() {
            let strategy = ChunkStrategy::parse(name).unwrap();
            assert_eq!(strategy.name(), name);
        }
    }

    #[test]
    fn test_refines_flag() {
        assert!(ChunkStrategy::AutomaticAdjusted.refines());
        assert!(ChunkStrategy::LineRangesAdjusted.refines());
        assert!(!ChunkStrategy::Automatic.refines());
        assert!(!ChunkStrategy::PerFile.refines());
    }

    fn chunk(index: usize, start: usize, end: usize) -> Chunk {
        Chunk::new(index, LineRange::new(start, end), String::new())
    }

    #[test]
    fn test_validate_chunks_accepts_gap() {
        // A gap is legal after refinement deletes an empty range
        let chunks = vec![chunk(1, 1, 100), chunk(2, 151, 300)];
        assert!(validate_chunks(&chunks, 300).is_ok());
    }

    #[test]
    fn test_validate_chunks_rejects_overlap() {
        let chunks = vec![chunk(1, 1, 100), chunk(2, 100, 200)];
        assert!(validate_chunks(&chunks, 200).is_err());
    }

    #[test]
    fn test_validate_chunks_rejects_bad_index() {
        let chunks = vec![chunk(1, 1, 10), chunk(3, 11, 20)];
        assert!(validate_chunks(&chunks, 20).is_err());
    }

    #[test]
    fn test_validate_chunks_rejects_out_of_bounds() {
        let chunks = vec![chunk(1, 1, 50)];
        assert!(validate_chunks(&chunks, 40).is_err());
    }

    #[test]
    fn test_validate_chunks_empty_ok() {
        assert!(validate_chunks(&[], 0).is_ok());
    }
}
