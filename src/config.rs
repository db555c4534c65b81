//! Runtime configuration with builder pattern and environment variable support.
//!
//! Configuration is resolved in order: explicit values → environment variables → defaults.
//! Provider credentials are not held here; adapters read them from the
//! environment at construction time.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::Error;

/// Default target model.
const DEFAULT_MODEL: &str = "gpt-4o-mini";
/// Default token budget per chunk.
const DEFAULT_TOKENS_PER_CHUNK: usize = 10_000;
/// Default maximum concurrent chunk requests.
const DEFAULT_CONCURRENCY_LIMIT: usize = 10;
/// Default request attempts (first try plus retries).
const DEFAULT_ATTEMPTS: u32 = 5;
/// Default initial backoff delay in seconds.
const DEFAULT_WAIT_MIN_SECS: u64 = 1;
/// Default backoff ceiling in seconds.
const DEFAULT_WAIT_MAX_SECS: u64 = 60;
/// Default maximum uniform jitter in milliseconds.
const DEFAULT_JITTER_MAX_MS: u64 = 1_000;
/// Default per-request provider timeout in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 120;
/// Default response token cap.
const DEFAULT_MAX_OUTPUT_TOKENS: u32 = 16_384;
/// Default schema directory.
const DEFAULT_SCHEMA_DIR: &str = "schemas";
/// Default output directory.
const DEFAULT_OUTPUT_DIR: &str = "output";

/// Boundary refinement tuning knobs.
#[derive(Debug, Clone)]
pub struct RefinementConfig {
    /// Lines of context on each side of a candidate boundary.
    pub window_lines: usize,
    /// Minimum certainty (0-100) required to act on a verdict.
    pub certainty_threshold: u8,
    /// Window multiplier for the empty-range verification scan.
    pub verification_multiplier: usize,
    /// Maximum times the window may be doubled on `needs_more_context`.
    pub max_context_expansion_attempts: u32,
    /// Maximum retries when certainty stays below the threshold.
    pub max_low_certainty_retries: u32,
}

impl Default for RefinementConfig {
    fn default() -> Self {
        Self {
            window_lines: 300,
            certainty_threshold: 70,
            verification_multiplier: 3,
            max_context_expansion_attempts: 3,
            max_low_certainty_retries: 3,
        }
    }
}

/// Configuration for the extraction pipeline.
#[derive(Debug, Clone)]
pub struct Config {
    /// Target model name (drives provider detection and tokenization).
    pub model: String,
    /// Explicit provider tag, overriding detection from the model name.
    pub provider_override: Option<String>,
    /// Token budget per chunk for the automatic strategy.
    pub tokens_per_chunk: usize,
    /// Maximum concurrent chunk requests.
    pub concurrency_limit: usize,
    /// Attempts per request (first try plus retries).
    pub attempts: u32,
    /// Initial backoff delay.
    pub wait_min: Duration,
    /// Backoff ceiling.
    pub wait_max: Duration,
    /// Maximum uniform jitter added to each backoff delay.
    pub jitter_max: Duration,
    /// Per-request provider timeout.
    pub timeout: Duration,
    /// Response token cap passed to the provider.
    pub max_output_tokens: u32,
    /// Sampling temperature, dropped for models that reject it.
    pub temperature: Option<f32>,
    /// Nucleus sampling parameter, dropped for models that reject it.
    pub top_p: Option<f32>,
    /// Reasoning effort hint (`low`, `medium`, `high`) for reasoning models.
    pub reasoning_effort: Option<String>,
    /// Daily token budget. `None` disables enforcement entirely.
    pub daily_token_limit: Option<u64>,
    /// Abort instead of blocking when the daily budget is exhausted.
    pub no_wait: bool,
    /// Keep the per-file journal after a successful aggregate write.
    pub retain_temporary_jsonl: bool,
    /// Directory scanned for schema files at startup.
    pub schema_dir: PathBuf,
    /// Root directory for aggregates, journals, and the ledger state file.
    pub output_dir: PathBuf,
    /// Boundary refinement knobs.
    pub refinement: RefinementConfig,
}

impl Config {
    /// Creates a new builder.
    #[must_use]
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Creates configuration from environment variables with defaults.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when a value fails validation.
    pub fn from_env() -> Result<Self, Error> {
        Self::builder().from_env().build()
    }

    /// Returns the output directory for one schema's results.
    #[must_use]
    pub fn schema_output_dir(&self, schema_name: &str) -> PathBuf {
        self.output_dir.join(schema_name)
    }

    /// Returns the path of the process-wide token ledger state file.
    #[must_use]
    pub fn ledger_path(&self) -> PathBuf {
        self.output_dir.join(".chronominer_token_state.json")
    }
}

/// Builder for [`Config`].
#[derive(Debug, Clone, Default)]
pub struct ConfigBuilder {
    model: Option<String>,
    provider_override: Option<String>,
    tokens_per_chunk: Option<usize>,
    concurrency_limit: Option<usize>,
    attempts: Option<u32>,
    wait_min: Option<Duration>,
    wait_max: Option<Duration>,
    jitter_max: Option<Duration>,
    timeout: Option<Duration>,
    max_output_tokens: Option<u32>,
    temperature: Option<f32>,
    top_p: Option<f32>,
    reasoning_effort: Option<String>,
    daily_token_limit: Option<u64>,
    no_wait: bool,
    retain_temporary_jsonl: bool,
    schema_dir: Option<PathBuf>,
    output_dir: Option<PathBuf>,
    refinement: Option<RefinementConfig>,
}

impl ConfigBuilder {
    /// Populates unset fields from environment variables.
    #[must_use]
    pub fn from_env(mut self) -> Self {
        if self.model.is_none() {
            self.model = std::env::var("CHRONOMINER_MODEL").ok();
        }
        if self.provider_override.is_none() {
            self.provider_override = std::env::var("CHRONOMINER_PROVIDER").ok();
        }
        if self.tokens_per_chunk.is_none() {
            self.tokens_per_chunk = std::env::var("CHRONOMINER_TOKENS_PER_CHUNK")
                .ok()
                .and_then(|v| v.parse().ok());
        }
        if self.concurrency_limit.is_none() {
            self.concurrency_limit = std::env::var("CHRONOMINER_CONCURRENCY")
                .ok()
                .and_then(|v| v.parse().ok());
        }
        if self.daily_token_limit.is_none() {
            self.daily_token_limit = std::env::var("CHRONOMINER_DAILY_TOKEN_LIMIT")
                .ok()
                .and_then(|v| v.parse().ok());
        }
        if self.schema_dir.is_none() {
            self.schema_dir = std::env::var("CHRONOMINER_SCHEMA_DIR").ok().map(PathBuf::from);
        }
        if self.output_dir.is_none() {
            self.output_dir = std::env::var("CHRONOMINER_OUTPUT_DIR").ok().map(PathBuf::from);
        }
        self
    }

    /// Sets the target model.
    #[must_use]
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Forces a specific provider tag instead of detecting from the model name.
    #[must_use]
    pub fn provider_override(mut self, provider: impl Into<String>) -> Self {
        self.provider_override = Some(provider.into());
        self
    }

    /// Sets the per-chunk token budget.
    #[must_use]
    pub const fn tokens_per_chunk(mut self, n: usize) -> Self {
        self.tokens_per_chunk = Some(n);
        self
    }

    /// Sets the maximum concurrent chunk requests.
    #[must_use]
    pub const fn concurrency_limit(mut self, n: usize) -> Self {
        self.concurrency_limit = Some(n);
        self
    }

    /// Sets attempts per request (first try plus retries).
    #[must_use]
    pub const fn attempts(mut self, n: u32) -> Self {
        self.attempts = Some(n);
        self
    }

    /// Sets the initial backoff delay.
    #[must_use]
    pub const fn wait_min(mut self, d: Duration) -> Self {
        self.wait_min = Some(d);
        self
    }

    /// Sets the backoff ceiling.
    #[must_use]
    pub const fn wait_max(mut self, d: Duration) -> Self {
        self.wait_max = Some(d);
        self
    }

    /// Sets the maximum uniform backoff jitter.
    #[must_use]
    pub const fn jitter_max(mut self, d: Duration) -> Self {
        self.jitter_max = Some(d);
        self
    }

    /// Sets the per-request provider timeout.
    #[must_use]
    pub const fn timeout(mut self, d: Duration) -> Self {
        self.timeout = Some(d);
        self
    }

    /// Sets the response token cap.
    #[must_use]
    pub const fn max_output_tokens(mut self, n: u32) -> Self {
        self.max_output_tokens = Some(n);
        self
    }

    /// Sets the sampling temperature.
    #[must_use]
    pub const fn temperature(mut self, t: f32) -> Self {
        self.temperature = Some(t);
        self
    }

    /// Sets the nucleus sampling parameter.
    #[must_use]
    pub const fn top_p(mut self, p: f32) -> Self {
        self.top_p = Some(p);
        self
    }

    /// Sets the reasoning effort hint.
    #[must_use]
    pub fn reasoning_effort(mut self, effort: impl Into<String>) -> Self {
        self.reasoning_effort = Some(effort.into());
        self
    }

    /// Sets the daily token budget.
    #[must_use]
    pub const fn daily_token_limit(mut self, limit: u64) -> Self {
        self.daily_token_limit = Some(limit);
        self
    }

    /// Aborts instead of blocking when the daily budget is exhausted.
    #[must_use]
    pub const fn no_wait(mut self, no_wait: bool) -> Self {
        self.no_wait = no_wait;
        self
    }

    /// Keeps journals after successful aggregate writes.
    #[must_use]
    pub const fn retain_temporary_jsonl(mut self, retain: bool) -> Self {
        self.retain_temporary_jsonl = retain;
        self
    }

    /// Sets the schema directory.
    #[must_use]
    pub fn schema_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.schema_dir = Some(dir.into());
        self
    }

    /// Sets the output root directory.
    #[must_use]
    pub fn output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    /// Sets the boundary refinement knobs.
    #[must_use]
    pub fn refinement(mut self, refinement: RefinementConfig) -> Self {
        self.refinement = Some(refinement);
        self
    }

    /// Builds the [`Config`], validating the resolved values.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when a resolved value is out of range.
    pub fn build(self) -> Result<Config, Error> {
        let config = Config {
            model: self.model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            provider_override: self.provider_override,
            tokens_per_chunk: self.tokens_per_chunk.unwrap_or(DEFAULT_TOKENS_PER_CHUNK),
            concurrency_limit: self.concurrency_limit.unwrap_or(DEFAULT_CONCURRENCY_LIMIT),
            attempts: self.attempts.unwrap_or(DEFAULT_ATTEMPTS),
            wait_min: self
                .wait_min
                .unwrap_or(Duration::from_secs(DEFAULT_WAIT_MIN_SECS)),
            wait_max: self
                .wait_max
                .unwrap_or(Duration::from_secs(DEFAULT_WAIT_MAX_SECS)),
            jitter_max: self
                .jitter_max
                .unwrap_or(Duration::from_millis(DEFAULT_JITTER_MAX_MS)),
            timeout: self
                .timeout
                .unwrap_or(Duration::from_secs(DEFAULT_TIMEOUT_SECS)),
            max_output_tokens: self.max_output_tokens.unwrap_or(DEFAULT_MAX_OUTPUT_TOKENS),
            temperature: self.temperature,
            top_p: self.top_p,
            reasoning_effort: self.reasoning_effort,
            daily_token_limit: self.daily_token_limit,
            no_wait: self.no_wait,
            retain_temporary_jsonl: self.retain_temporary_jsonl,
            schema_dir: self
                .schema_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_SCHEMA_DIR)),
            output_dir: self
                .output_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_DIR)),
            refinement: self.refinement.unwrap_or_default(),
        };

        validate(&config)?;
        Ok(config)
    }
}

/// Validates resolved configuration values.
fn validate(config: &Config) -> Result<(), Error> {
    if config.model.trim().is_empty() {
        return Err(Error::Config {
            message: "model must not be empty".to_string(),
        });
    }
    if config.tokens_per_chunk == 0 {
        return Err(Error::Config {
            message: "tokens_per_chunk must be > 0".to_string(),
        });
    }
    if config.concurrency_limit == 0 {
        return Err(Error::Config {
            message: "concurrency_limit must be > 0".to_string(),
        });
    }
    if config.attempts == 0 {
        return Err(Error::Config {
            message: "attempts must be > 0".to_string(),
        });
    }
    if config.wait_min > config.wait_max {
        return Err(Error::Config {
            message: format!(
                "wait_min ({:?}) must not exceed wait_max ({:?})",
                config.wait_min, config.wait_max
            ),
        });
    }
    if config.daily_token_limit == Some(0) {
        return Err(Error::Config {
            message: "daily_token_limit must be > 0 when set".to_string(),
        });
    }
    if config.refinement.certainty_threshold > 100 {
        return Err(Error::Config {
            message: "certainty_threshold must be in 0..=100".to_string(),
        });
    }
    if let Some(effort) = &config.reasoning_effort
        && crate::provider::ReasoningEffort::parse(effort).is_none()
    {
        return Err(Error::Config {
            message: format!("unknown reasoning effort: {effort} (low, medium, high)"),
        });
    }
    Ok(())
}
