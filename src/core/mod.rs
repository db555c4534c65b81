//! Core domain types shared across the pipeline.
//!
//! Chunks, line ranges, request identifiers, and token usage records are
//! referenced by every stage from segmentation to aggregation.

pub mod cancel;
pub mod chunk;
pub mod usage;

pub use cancel::{CancelHandle, CancelToken};
pub use chunk::{Chunk, LineRange, custom_id, parse_custom_id};
pub use usage::TokenUsage;
