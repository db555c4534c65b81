//! Command-line interface: argument parsing, command implementations,
//! and output formatting.

pub mod commands;
pub mod output;
pub mod parser;

pub use commands::{ExecuteOutcome, execute};
pub use output::{OutputFormat, format_error};
pub use parser::{Cli, Commands};
