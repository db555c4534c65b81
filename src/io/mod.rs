//! File I/O: normalized source loading and durable writes.

pub mod reader;

pub use reader::{SourceText, atomic_write_file, read_file, write_file};
