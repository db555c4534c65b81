//! Model-aware token counting.
//!
//! Counting is a pure function of the text and the model name. Encodings
//! are resolved per model family and cached process-wide; families without
//! a known encoding fall back to the default one, and if no encoder can be
//! constructed at all the count degrades to a characters-per-token
//! heuristic rather than failing.

use std::sync::LazyLock;

use rayon::prelude::*;
use tiktoken_rs::CoreBPE;

/// Fallback ratio when no encoder is available (~4 chars per token).
const HEURISTIC_CHARS_PER_TOKEN: usize = 4;

/// Minimum lines before per-line counting fans out across threads.
const PARALLEL_THRESHOLD: usize = 512;

// The tiktoken constructors report vocabulary-loading failures through
// anyhow; the error is kept so the first caller can log it.
static O200K_BASE: LazyLock<anyhow::Result<CoreBPE>> =
    LazyLock::new(tiktoken_rs::o200k_base);
static CL100K_BASE: LazyLock<anyhow::Result<CoreBPE>> =
    LazyLock::new(tiktoken_rs::cl100k_base);

/// Tokenizer encodings recognized per model family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Encoding {
    /// `o200k_base`: current OpenAI models; also the default fallback.
    O200k,
    /// `cl100k_base`: older GPT-3.5/GPT-4 generations.
    Cl100k,
}

impl Encoding {
    /// Resolves the encoding for a model name.
    ///
    /// Non-OpenAI families (Claude, Gemini, OpenRouter-routed vendors) do
    /// not publish tokenizers compatible with tiktoken; the default
    /// encoding gives a close-enough estimate for chunk sizing and budget
    /// accounting.
    fn for_model(model: &str) -> Self {
        let lower = model.to_lowercase();
        if lower.starts_with("gpt-3.5") || (lower.starts_with("gpt-4") && !lower.starts_with("gpt-4o"))
        {
            Self::Cl100k
        } else {
            Self::O200k
        }
    }

    fn bpe(self) -> Option<&'static CoreBPE> {
        let built = match self {
            Self::O200k => &*O200K_BASE,
            Self::Cl100k => &*CL100K_BASE,
        };
        match built {
            Ok(bpe) => Some(bpe),
            Err(e) => {
                tracing::warn!(error = %e, "tokenizer unavailable, using character heuristic");
                None
            }
        }
    }
}

/// Counts the tokens of `text` under the encoding for `model`.
///
/// Falls back to a character heuristic when no encoder could be built
/// (e.g. missing vocabulary data), so the result is always defined.
#[must_use]
pub fn count(text: &str, model: &str) -> usize {
    Encoding::for_model(model).bpe().map_or_else(
        || text.chars().count().div_ceil(HEURISTIC_CHARS_PER_TOKEN),
        |bpe| bpe.encode_ordinary(text).len(),
    )
}

/// Counts tokens for each line independently.
///
/// Used by the automatic chunker, which needs per-line counts before its
/// greedy accumulation pass. Large files fan the counting out across
/// threads; the output order always matches the input order.
#[must_use]
pub fn count_lines(lines: &[&str], model: &str) -> Vec<usize> {
    if lines.len() >= PARALLEL_THRESHOLD {
        lines.par_iter().map(|line| count(line, model)).collect()
    } else {
        lines.iter().map(|line| count(line, model)).collect()
    }
}
