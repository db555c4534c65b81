//! Error types for extraction operations.
//!
//! This module provides a comprehensive error hierarchy using `thiserror` for
//! all operations including chunking, provider calls, the token ledger,
//! journaling, batch jobs, and CLI commands.

use thiserror::Error;

/// Result type alias for extraction operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Comprehensive error types for extraction operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Chunking-related errors (text segmentation).
    #[error("chunking error: {0}")]
    Chunking(#[from] ChunkingError),

    /// Provider-related errors (LLM API calls).
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Token ledger errors (daily budget enforcement).
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    /// Journal errors (per-file result log).
    #[error("journal error: {0}")]
    Journal(#[from] JournalError),

    /// Batch job errors (asynchronous provider batches).
    #[error("batch error: {0}")]
    Batch(#[from] BatchError),

    /// Schema registry errors.
    #[error("schema error: {0}")]
    Schema(#[from] SchemaError),

    /// I/O errors (file operations).
    #[error("I/O error: {0}")]
    Io(#[from] IoError),

    /// CLI command errors.
    #[error("command error: {0}")]
    Command(#[from] CommandError),

    /// Configuration errors. Fatal at startup.
    #[error("configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },
}

/// Chunking-specific errors for text segmentation.
#[derive(Error, Debug)]
pub enum ChunkingError {
    /// Invalid chunking configuration.
    #[error("invalid chunking configuration: {reason}")]
    InvalidConfig {
        /// Reason the configuration is invalid.
        reason: String,
    },

    /// The co-located line-range file is missing or empty.
    #[error("no line ranges found for {path} (run `chronominer generate-line-ranges` first)")]
    MissingLineRanges {
        /// Source file the line ranges belong to.
        path: String,
    },

    /// A line-range pair could not be parsed.
    #[error("invalid line range on line {line}: {text:?}")]
    InvalidRange {
        /// Line number in the range file (1-based).
        line: usize,
        /// Offending text.
        text: String,
    },

    /// A line range falls outside the source file.
    #[error("line range {start}-{end} out of bounds (file has {line_count} lines)")]
    RangeOutOfBounds {
        /// First line of the range.
        start: usize,
        /// Last line of the range.
        end: usize,
        /// Number of lines in the source file.
        line_count: usize,
    },

    /// Two line ranges overlap.
    #[error("line ranges {first_start}-{first_end} and {second_start}-{second_end} overlap")]
    OverlappingRanges {
        /// First range start.
        first_start: usize,
        /// First range end.
        first_end: usize,
        /// Second range start.
        second_start: usize,
        /// Second range end.
        second_end: usize,
    },

    /// Unknown chunking strategy name.
    #[error("unknown chunking strategy: {name}")]
    UnknownStrategy {
        /// Name of the unknown strategy.
        name: String,
    },
}

/// Provider-specific errors for LLM API calls.
///
/// The variants encode the retry policy: [`ProviderError::Transient`] is
/// retried with backoff, everything else fails the chunk immediately.
#[derive(Error, Debug)]
pub enum ProviderError {
    /// No API key found for the provider in the environment.
    #[error("no API key for {provider} (set {env_var})")]
    AuthMissing {
        /// Provider tag.
        provider: String,
        /// Environment variable that should hold the key.
        env_var: String,
    },

    /// The provider rejected the credentials.
    #[error("authentication rejected by {provider}: {message}")]
    AuthInvalid {
        /// Provider tag.
        provider: String,
        /// Provider's error message.
        message: String,
    },

    /// Transient failure: timeout, 5xx, 429, or network error. Retryable.
    #[error("transient provider error{}: {message}", .status.map(|s| format!(" (HTTP {s})")).unwrap_or_default())]
    Transient {
        /// Provider's error message.
        message: String,
        /// HTTP status, when the failure reached the HTTP layer.
        status: Option<u16>,
    },

    /// Permanent failure: non-auth 4xx. Not retried.
    #[error("permanent provider error{}: {message}", .status.map(|s| format!(" (HTTP {s})")).unwrap_or_default())]
    Permanent {
        /// Provider's error message.
        message: String,
        /// HTTP status code.
        status: Option<u16>,
    },

    /// The response body is not a parseable structured object.
    #[error("response validation failed: {message}")]
    Validation {
        /// Why the response was rejected.
        message: String,
        /// Raw response content, preserved verbatim for the journal.
        content: String,
    },

    /// The provider rejected the schema as too complex.
    #[error("schema rejected by {model}: {message}")]
    SchemaUnsupported {
        /// Model that rejected the schema.
        model: String,
        /// Provider's rejection message.
        message: String,
    },

    /// The model name does not match any recognized provider family.
    #[error("unrecognized model: {model}")]
    UnknownModel {
        /// Model name that could not be mapped to a provider.
        model: String,
    },
}

impl ProviderError {
    /// Returns true when the scheduler should retry this error with backoff.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

/// Token ledger errors.
#[derive(Error, Debug)]
pub enum LedgerError {
    /// The daily token budget is exhausted and waiting was not permitted.
    #[error("daily token limit reached ({used}/{limit}); resets at {resets_at}")]
    LimitReached {
        /// Tokens used so far today.
        used: u64,
        /// Configured daily limit.
        limit: u64,
        /// Next local-midnight reset, RFC 3339.
        resets_at: String,
    },

    /// A single request's estimate exceeds the whole daily limit.
    #[error("estimated {estimated} tokens exceeds the daily limit of {limit}")]
    EstimateExceedsLimit {
        /// Estimated tokens for the request.
        estimated: u64,
        /// Configured daily limit.
        limit: u64,
    },

    /// The ledger state file could not be read or written.
    #[error("ledger persistence failed at {path}: {reason}")]
    Persistence {
        /// Path to the state file.
        path: String,
        /// Reason for failure.
        reason: String,
    },

    /// The operation was cancelled while waiting for the midnight reset.
    #[error("cancelled while waiting for the daily limit reset")]
    WaitCancelled,
}

/// Journal errors for the per-file result log.
#[derive(Error, Debug)]
pub enum JournalError {
    /// A journal line could not be parsed.
    #[error("malformed journal record at {path}:{line}: {reason}")]
    Malformed {
        /// Journal file path.
        path: String,
        /// Line number (1-based).
        line: usize,
        /// Parse failure reason.
        reason: String,
    },

    /// The journal is missing its metadata header.
    #[error("journal {path} has no metadata header")]
    MissingHeader {
        /// Journal file path.
        path: String,
    },

    /// Append or flush failed.
    #[error("failed to append to journal {path}: {reason}")]
    AppendFailed {
        /// Journal file path.
        path: String,
        /// Reason for failure.
        reason: String,
    },
}

/// Batch job errors.
#[derive(Error, Debug)]
pub enum BatchError {
    /// The batch terminated adversely on the provider side.
    #[error("batch {batch_id} failed: {reason}")]
    Failed {
        /// Provider batch identifier.
        batch_id: String,
        /// Terminal failure reason.
        reason: String,
    },

    /// Batch mode is not supported for this provider.
    #[error("batch mode not supported for {provider}")]
    Unsupported {
        /// Provider tag.
        provider: String,
    },

    /// The provider returned an unknown batch state.
    #[error("unknown batch state {state:?} for {batch_id}")]
    UnknownState {
        /// Raw provider state string.
        state: String,
        /// Provider batch identifier.
        batch_id: String,
    },

    /// A batch API call failed.
    #[error("batch API call failed: {0}")]
    Api(#[from] ProviderError),

    /// Batch results are not available yet.
    #[error("batch {batch_id} has no results yet (status: {status})")]
    NotReady {
        /// Provider batch identifier.
        batch_id: String,
        /// Current unified status.
        status: String,
    },
}

/// Schema registry errors.
#[derive(Error, Debug)]
pub enum SchemaError {
    /// The requested schema name is not in the registry.
    #[error("unknown schema: {name} (available: {available})")]
    Unknown {
        /// Requested schema name.
        name: String,
        /// Comma-separated available names.
        available: String,
    },

    /// Two schema files declare the same name.
    #[error("duplicate schema name {name:?} ({first} and {second})")]
    Duplicate {
        /// Duplicated name.
        name: String,
        /// First file declaring it.
        first: String,
        /// Second file declaring it.
        second: String,
    },

    /// A schema file is not valid JSON or not an object at the top level.
    #[error("invalid schema file {path}: {reason}")]
    Invalid {
        /// Schema file path.
        path: String,
        /// Validation failure reason.
        reason: String,
    },

    /// The schema directory is missing.
    #[error("schema directory not found: {path}")]
    DirectoryMissing {
        /// Configured schema directory.
        path: String,
    },
}

/// I/O-specific errors for file operations.
#[derive(Error, Debug)]
pub enum IoError {
    /// File not found.
    #[error("file not found: {path}")]
    FileNotFound {
        /// Path to the file that was not found.
        path: String,
    },

    /// Failed to read file.
    #[error("failed to read file: {path}: {reason}")]
    ReadFailed {
        /// Path to the file.
        path: String,
        /// Reason for failure.
        reason: String,
    },

    /// Failed to write file.
    #[error("failed to write file: {path}: {reason}")]
    WriteFailed {
        /// Path to the file.
        path: String,
        /// Reason for failure.
        reason: String,
    },

    /// Memory mapping error.
    #[error("memory mapping failed: {path}: {reason}")]
    MmapFailed {
        /// Path to the file.
        path: String,
        /// Reason for failure.
        reason: String,
    },

    /// Directory creation error.
    #[error("failed to create directory: {path}: {reason}")]
    DirectoryFailed {
        /// Path to the directory.
        path: String,
        /// Reason for failure.
        reason: String,
    },

    /// Generic I/O error wrapper.
    #[error("I/O error: {0}")]
    Generic(String),
}

/// CLI command-specific errors.
#[derive(Error, Debug)]
pub enum CommandError {
    /// Invalid argument provided.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// No input files matched.
    #[error("no input files found at {path}")]
    NoInputs {
        /// Input path given on the command line.
        path: String,
    },

    /// Command execution failed.
    #[error("command execution failed: {0}")]
    ExecutionFailed(String),

    /// User cancelled operation.
    #[error("operation cancelled by user")]
    Cancelled,
}

// Implement From traits for standard library and ecosystem errors

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Io(IoError::Generic(err.to_string()))
    }
}

impl From<serde_json::Error> for JournalError {
    fn from(err: serde_json::Error) -> Self {
        Self::Malformed {
            path: String::new(),
            line: 0,
            reason: err.to_string(),
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        let status = err.status().map(|s| s.as_u16());
        if err.is_timeout() || err.is_connect() {
            return Self::Transient {
                message: err.to_string(),
                status,
            };
        }
        match status {
            Some(s) if s == 429 || s >= 500 => Self::Transient {
                message: err.to_string(),
                status,
            },
            Some(s) if s == 401 || s == 403 => Self::AuthInvalid {
                provider: "http".to_string(),
                message: err.to_string(),
            },
            Some(_) => Self::Permanent {
                message: err.to_string(),
                status,
            },
            None => Self::Transient {
                message: err.to_string(),
                status: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Config {
            message: "bad config".to_string(),
        };
        assert_eq!(err.to_string(), "configuration error: bad config");
    }

    #[test]
    fn test_chunking_error_display() {
        let err = ChunkingError::RangeOutOfBounds {
            start: 10,
            end: 20,
            line_count: 15,
        };
        assert_eq!(
            err.to_string(),
            "line range 10-20 out of bounds (file has 15 lines)"
        );

        let err = ChunkingError::UnknownStrategy {
            name: "foobar".to_string(),
        };
        assert!(err.to_string().contains("foobar"));
    }

    #[test]
    fn test_provider_error_retryable() {
        let transient = ProviderError::Transient {
            message: "503".to_string(),
            status: Some(503),
        };
        assert!(transient.is_retryable());

        let permanent = ProviderError::Permanent {
            message: "bad request".to_string(),
            status: Some(400),
        };
        assert!(!permanent.is_retryable());

        let validation = ProviderError::Validation {
            message: "not json".to_string(),
            content: "garbage".to_string(),
        };
        assert!(!validation.is_retryable());
    }

    #[test]
    fn test_provider_error_display_with_status() {
        let err = ProviderError::Transient {
            message: "overloaded".to_string(),
            status: Some(529),
        };
        assert!(err.to_string().contains("HTTP 529"));
        assert!(err.to_string().contains("overloaded"));
    }

    #[test]
    fn test_ledger_error_display() {
        let err = LedgerError::LimitReached {
            used: 950,
            limit: 1000,
            resets_at: "2026-01-02T00:00:00+00:00".to_string(),
        };
        assert!(err.to_string().contains("950/1000"));
    }

    #[test]
    fn test_batch_error_display() {
        let err = BatchError::Unsupported {
            provider: "openrouter".to_string(),
        };
        assert_eq!(err.to_string(), "batch mode not supported for openrouter");
    }

    #[test]
    fn test_schema_error_display() {
        let err = SchemaError::Unknown {
            name: "missing".to_string(),
            available: "a, b".to_string(),
        };
        assert!(err.to_string().contains("missing"));
        assert!(err.to_string().contains("a, b"));
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_error_from_provider() {
        let provider_err = ProviderError::UnknownModel {
            model: "mystery-9000".to_string(),
        };
        let err: Error = provider_err.into();
        assert!(matches!(err, Error::Provider(_)));
    }

    #[test]
    fn test_error_from_ledger() {
        let ledger_err = LedgerError::WaitCancelled;
        let err: Error = ledger_err.into();
        assert!(matches!(err, Error::Ledger(_)));
    }

    #[test]
    fn test_journal_error_from_serde() {
        let json_err: serde_json::Error = serde_json::from_str::<i32>("nope").unwrap_err();
        let err: JournalError = json_err.into();
        assert!(matches!(err, JournalError::Malformed { .. }));
    }

    #[test]
    fn test_command_error_display() {
        let err = CommandError::NoInputs {
            path: "/data/empty".to_string(),
        };
        assert!(err.to_string().contains("/data/empty"));
    }
}
