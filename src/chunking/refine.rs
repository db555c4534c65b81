//! Semantic boundary refinement.
//!
//! Chunk starts produced by the budget chunker or a hand-edited range file
//! can land mid-entry. Refinement asks the model, for each internal
//! boundary, whether a natural marker (entry beginning, section header)
//! sits nearby, and shifts the boundary onto it. Each boundary runs a
//! small state machine with explicit budgets: the context window doubles
//! on `needs_more_context`, low-certainty verdicts retry a bounded number
//! of times, and an exhausted budget keeps the original boundary.
//!
//! A window the model declares empty of boundaries is verified with a
//! wider relevance scan; when nothing relevant is found either, the range
//! is deleted and its lines fall to the following chunk. The last range
//! of a file is never deleted.

use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::config::RefinementConfig;
use crate::core::{CancelToken, LineRange};
use crate::error::Result;
use crate::io::SourceText;
use crate::provider::{InvokeRequest, ModelParameters, Provider};
use crate::tokens::{self, DailyLedger};

/// Response cap for verdict queries; verdicts are tiny.
const VERDICT_MAX_TOKENS: u32 = 1_024;

/// Structured verdict returned by the boundary query.
#[derive(Debug, Clone, Deserialize)]
struct BoundaryVerdict {
    contains_no_semantic_boundary: bool,
    needs_more_context: bool,
    #[serde(default)]
    semantic_marker: Option<String>,
    certainty: u8,
}

/// Structured verdict returned by the relevance probe.
#[derive(Debug, Clone, Deserialize)]
struct RelevanceVerdict {
    contains_relevant_content: bool,
}

/// What happened to one internal boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoundaryAction {
    /// The boundary moved onto a located marker line.
    Shifted {
        /// New first line of the chunk.
        new_start: usize,
        /// Marker text the model identified.
        marker: String,
    },
    /// The range was empty and its lines merged into the next chunk.
    Deleted,
    /// The original boundary was kept.
    Kept {
        /// Why nothing changed.
        reason: String,
    },
}

/// Record of one boundary evaluation, surfaced by dry runs.
#[derive(Debug, Clone)]
pub struct BoundaryDecision {
    /// Original first line of the examined range.
    pub original_start: usize,
    /// Outcome.
    pub action: BoundaryAction,
    /// Verdict queries spent on this boundary.
    pub queries: u32,
}

/// Result of a refinement pass.
#[derive(Debug, Clone)]
pub struct RefinementReport {
    /// The refined ranges, sorted and non-overlapping.
    pub ranges: Vec<LineRange>,
    /// Per-boundary decisions in evaluation order.
    pub decisions: Vec<BoundaryDecision>,
}

impl RefinementReport {
    /// Whether the pass changed anything.
    #[must_use]
    pub fn changed(&self) -> bool {
        self.decisions
            .iter()
            .any(|d| !matches!(d.action, BoundaryAction::Kept { .. }))
    }
}

/// Certainty-gated boundary refiner.
pub struct BoundaryRefiner<'a> {
    provider: &'a dyn Provider,
    ledger: &'a DailyLedger,
    model: String,
    schema_name: String,
    /// Marker kind the model should look for, e.g. "entry beginning".
    boundary_type: String,
    config: RefinementConfig,
    no_wait: bool,
    cancel: CancelToken,
}

impl<'a> BoundaryRefiner<'a> {
    /// Creates a refiner bound to a provider, ledger, and schema.
    pub fn new(
        provider: &'a dyn Provider,
        ledger: &'a DailyLedger,
        model: impl Into<String>,
        schema_name: impl Into<String>,
        config: RefinementConfig,
    ) -> Self {
        Self {
            provider,
            ledger,
            model: model.into(),
            schema_name: schema_name.into(),
            boundary_type: "entry beginning".to_string(),
            config,
            no_wait: false,
            cancel: CancelToken::never(),
        }
    }

    /// Overrides the marker kind the model looks for.
    #[must_use]
    pub fn with_boundary_type(mut self, boundary_type: impl Into<String>) -> Self {
        self.boundary_type = boundary_type.into();
        self
    }

    /// Aborts instead of blocking on an exhausted daily budget.
    #[must_use]
    pub const fn with_no_wait(mut self, no_wait: bool) -> Self {
        self.no_wait = no_wait;
        self
    }

    /// Installs a cancellation token for long waits.
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Refines every internal boundary of `ranges` against `source`.
    ///
    /// The first range's start and the last range's existence are never
    /// touched. Returns the refined ranges plus a decision log.
    ///
    /// # Errors
    ///
    /// Returns an error when the daily budget is exhausted in non-blocking
    /// mode or the wait is cancelled. Provider failures on individual
    /// boundaries keep the original boundary instead of failing the pass.
    pub async fn refine(
        &self,
        source: &SourceText,
        ranges: &[LineRange],
    ) -> Result<RefinementReport> {
        let mut refined: Vec<LineRange> = ranges.to_vec();
        let mut decisions = Vec::new();

        let mut i = 1;
        while i < refined.len() {
            let decision = self.evaluate_boundary(source, &refined, i).await?;
            match &decision.action {
                BoundaryAction::Shifted { new_start, marker } => {
                    info!(
                        boundary = refined[i].start,
                        new_start,
                        marker = marker.as_str(),
                        "boundary shifted"
                    );
                    refined[i - 1].end = new_start - 1;
                    refined[i].start = *new_start;
                    i += 1;
                }
                BoundaryAction::Deleted => {
                    info!(
                        start = refined[i].start,
                        end = refined[i].end,
                        "empty range deleted"
                    );
                    // The following chunk absorbs the deleted lines
                    refined[i + 1].start = refined[i].start;
                    refined.remove(i);
                    i += 1;
                }
                BoundaryAction::Kept { reason } => {
                    debug!(boundary = refined[i].start, reason = reason.as_str(), "boundary kept");
                    i += 1;
                }
            }
            decisions.push(decision);
        }

        Ok(RefinementReport {
            ranges: refined,
            decisions,
        })
    }

    /// Runs the per-boundary state machine for the range at `index`.
    async fn evaluate_boundary(
        &self,
        source: &SourceText,
        ranges: &[LineRange],
        index: usize,
    ) -> Result<BoundaryDecision> {
        let candidate = ranges[index].start;
        let prev_start = ranges[index - 1].start;
        let next_start = ranges
            .get(index + 1)
            .map_or(source.line_count() + 1, |r| r.start);
        let is_last = index == ranges.len() - 1;

        let mut window = self.config.window_lines.max(1);
        let mut expansions = 0u32;
        let mut low_certainty = 0u32;
        let mut queries = 0u32;

        loop {
            let win_range = window_around(candidate, window, source.line_count());
            let verdict = match self.query_boundary(source, win_range, candidate).await {
                Ok(verdict) => {
                    queries += 1;
                    verdict
                }
                Err(err @ crate::error::Error::Ledger(_)) => return Err(err),
                Err(e) => {
                    warn!(boundary = candidate, error = %e, "boundary query failed");
                    return Ok(BoundaryDecision {
                        original_start: candidate,
                        action: BoundaryAction::Kept {
                            reason: format!("query failed: {e}"),
                        },
                        queries: queries + 1,
                    });
                }
            };

            if verdict.certainty >= self.config.certainty_threshold {
                if let Some(marker) = verdict
                    .semantic_marker
                    .as_deref()
                    .filter(|m| !m.trim().is_empty())
                {
                    if let Some(line) = source.find_line_containing(win_range, marker) {
                        // Never cross a neighbouring boundary
                        let clamped = line.clamp(prev_start + 1, next_start.saturating_sub(1));
                        let action = if clamped == candidate {
                            BoundaryAction::Kept {
                                reason: "already aligned with marker".to_string(),
                            }
                        } else {
                            BoundaryAction::Shifted {
                                new_start: clamped,
                                marker: marker.to_string(),
                            }
                        };
                        return Ok(BoundaryDecision {
                            original_start: candidate,
                            action,
                            queries,
                        });
                    }
                    // Marker not found verbatim; treat as an uncertain verdict
                } else if verdict.contains_no_semantic_boundary {
                    let action = self
                        .verify_empty_range(source, ranges[index], window, is_last)
                        .await?;
                    return Ok(BoundaryDecision {
                        original_start: candidate,
                        action,
                        queries: queries + 1,
                    });
                }
            }

            if verdict.needs_more_context
                && expansions < self.config.max_context_expansion_attempts
            {
                window *= 2;
                expansions += 1;
                debug!(boundary = candidate, window, "expanding context window");
                continue;
            }
            if verdict.certainty < self.config.certainty_threshold
                && low_certainty < self.config.max_low_certainty_retries
            {
                low_certainty += 1;
                debug!(
                    boundary = candidate,
                    certainty = verdict.certainty,
                    attempt = low_certainty,
                    "retrying low-certainty verdict"
                );
                continue;
            }

            return Ok(BoundaryDecision {
                original_start: candidate,
                action: BoundaryAction::Kept {
                    reason: "retry budget exhausted".to_string(),
                },
                queries,
            });
        }
    }

    /// Double-checks a declared-empty range with a wider relevance scan.
    async fn verify_empty_range(
        &self,
        source: &SourceText,
        range: LineRange,
        window: usize,
        is_last: bool,
    ) -> Result<BoundaryAction> {
        if is_last {
            return Ok(BoundaryAction::Kept {
                reason: "final range is never deleted".to_string(),
            });
        }

        let scan_window = window * self.config.verification_multiplier.max(1);
        let scan_range = window_around(range.start, scan_window, source.line_count());
        match self.query_relevance(source, scan_range).await {
            Ok(verdict) if !verdict.contains_relevant_content => Ok(BoundaryAction::Deleted),
            Ok(_) => Ok(BoundaryAction::Kept {
                reason: "verification scan found relevant content".to_string(),
            }),
            Err(err @ crate::error::Error::Ledger(_)) => Err(err),
            Err(e) => {
                warn!(start = range.start, error = %e, "verification scan failed");
                Ok(BoundaryAction::Kept {
                    reason: format!("verification failed: {e}"),
                })
            }
        }
    }

    async fn query_boundary(
        &self,
        source: &SourceText,
        window: LineRange,
        candidate: usize,
    ) -> Result<BoundaryVerdict> {
        let text = source.slice(window).unwrap_or_default();
        let prompt = format!(
            "A long document has been split into chunks for processing. The split \
             currently falls at line {candidate} within the excerpt below (lines \
             {}-{} of the document). Determine whether a natural {} lies in this \
             excerpt near the split.\n\
             Respond with: contains_no_semantic_boundary (true when the excerpt \
             holds no such marker at all), needs_more_context (true when the \
             excerpt is too narrow to decide), semantic_marker (the exact, \
             verbatim text of the marker line, or null), and certainty (0-100).\n\
             Quote the marker exactly as it appears, without adding line numbers.\n\
             \n----- EXCERPT -----\n{text}\n----- END EXCERPT -----",
            window.start, window.end, self.boundary_type,
        );
        let schema = json!({
            "type": "object",
            "properties": {
                "contains_no_semantic_boundary": {"type": "boolean"},
                "needs_more_context": {"type": "boolean"},
                "semantic_marker": {"type": ["string", "null"]},
                "certainty": {"type": "integer", "minimum": 0, "maximum": 100}
            },
            "required": [
                "contains_no_semantic_boundary",
                "needs_more_context",
                "semantic_marker",
                "certainty"
            ],
            "additionalProperties": false
        });

        let value = self.invoke_metered(&prompt, "boundary_verdict", schema).await?;
        serde_json::from_value(value).map_err(|e| {
            crate::error::ProviderError::Validation {
                message: format!("verdict did not match the expected shape: {e}"),
                content: String::new(),
            }
            .into()
        })
    }

    async fn query_relevance(
        &self,
        source: &SourceText,
        scan_range: LineRange,
    ) -> Result<RelevanceVerdict> {
        let text = source.slice(scan_range).unwrap_or_default();
        let prompt = format!(
            "The excerpt below comes from a document being mined for records \
             matching the \"{}\" schema. Decide whether it contains ANY content \
             such a record could be extracted from. Respond with \
             contains_relevant_content (boolean).\n\
             \n----- EXCERPT -----\n{text}\n----- END EXCERPT -----",
            self.schema_name,
        );
        let schema = json!({
            "type": "object",
            "properties": {"contains_relevant_content": {"type": "boolean"}},
            "required": ["contains_relevant_content"],
            "additionalProperties": false
        });

        let value = self.invoke_metered(&prompt, "relevance_verdict", schema).await?;
        serde_json::from_value(value).map_err(|e| {
            crate::error::ProviderError::Validation {
                message: format!("relevance verdict did not match the expected shape: {e}"),
                content: String::new(),
            }
            .into()
        })
    }

    /// Invokes the provider with ledger accounting around the call.
    async fn invoke_metered(
        &self,
        prompt: &str,
        schema_name: &str,
        schema: serde_json::Value,
    ) -> Result<serde_json::Value> {
        let estimated =
            tokens::count(prompt, &self.model) as u64 + u64::from(VERDICT_MAX_TOKENS);
        self.ledger
            .acquire(estimated, self.no_wait, &self.cancel)
            .await?;

        let request = InvokeRequest {
            model: self.model.clone(),
            prompt: prompt.to_string(),
            schema_name: schema_name.to_string(),
            schema,
            params: ModelParameters {
                temperature: Some(0.0),
                top_p: None,
                max_output_tokens: VERDICT_MAX_TOKENS,
                reasoning_effort: None,
            },
        };

        match self.provider.invoke(&request).await {
            Ok(response) => {
                self.ledger
                    .commit(estimated, response.usage.total())
                    .await?;
                Ok(response.value)
            }
            Err(e) => {
                // The call still consumed input tokens on failure; keep the
                // reservation's input share and release the output share.
                self.ledger
                    .commit(estimated, tokens::count(prompt, &self.model) as u64)
                    .await?;
                Err(e.into())
            }
        }
    }
}

/// Builds the window of `window` lines on each side of `center`, clamped
/// to the file.
fn window_around(center: usize, window: usize, line_count: usize) -> LineRange {
    let start = center.saturating_sub(window).max(1);
    let end = center.saturating_add(window).min(line_count);
    LineRange::new(start, end.max(start))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderError;
    use crate::provider::{InvokeResponse, ProviderKind};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Provider that pops scripted verdict values per call.
    struct ScriptedProvider {
        responses: Mutex<Vec<serde_json::Value>>,
    }

    impl ScriptedProvider {
        fn new(mut responses: Vec<serde_json::Value>) -> Self {
            responses.reverse();
            Self {
                responses: Mutex::new(responses),
            }
        }
    }

    #[async_trait]
    impl Provider for ScriptedProvider {
        fn kind(&self) -> ProviderKind {
            ProviderKind::OpenAi
        }

        async fn invoke(
            &self,
            request: &InvokeRequest,
        ) -> std::result::Result<InvokeResponse, ProviderError> {
            let value = self
                .responses
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .pop()
                .ok_or_else(|| ProviderError::Transient {
                    message: "script exhausted".to_string(),
                    status: None,
                })?;
            Ok(InvokeResponse {
                output_text: value.to_string(),
                value,
                usage: crate::core::TokenUsage {
                    input: 10,
                    cached_input: 0,
                    output: 5,
                    reasoning: 0,
                },
                model: request.model.clone(),
            })
        }
    }

    fn numbered_source(lines: usize) -> SourceText {
        let text: Vec<String> = (1..=lines).map(|i| format!("line {i}")).collect();
        SourceText::from_string(text.join("\n"))
    }

    fn marker_source() -> SourceText {
        // 200 lines; "## Entry" markers at lines 95 and 180
        let text: Vec<String> = (1..=200)
            .map(|i| match i {
                95 => "## Entry of 4 March".to_string(),
                180 => "## Entry of 5 March".to_string(),
                _ => format!("body text {i}"),
            })
            .collect();
        SourceText::from_string(text.join("\n"))
    }

    fn ledger(dir: &TempDir) -> DailyLedger {
        DailyLedger::open(dir.path().join("state.json"), None)
    }

    fn verdict(no_boundary: bool, more: bool, marker: Option<&str>, certainty: u8) -> serde_json::Value {
        json!({
            "contains_no_semantic_boundary": no_boundary,
            "needs_more_context": more,
            "semantic_marker": marker,
            "certainty": certainty,
        })
    }

    #[tokio::test]
    async fn test_shift_onto_marker() {
        let dir = TempDir::new().unwrap();
        let ledger = ledger(&dir);
        let provider = ScriptedProvider::new(vec![verdict(
            false,
            false,
            Some("## Entry of 4 March"),
            90,
        )]);
        let refiner = BoundaryRefiner::new(
            &provider,
            &ledger,
            "gpt-4o-mini",
            "entries",
            RefinementConfig::default(),
        );

        let source = marker_source();
        let ranges = vec![LineRange::new(1, 99), LineRange::new(100, 200)];
        let report = refiner.refine(&source, &ranges).await.unwrap();

        assert_eq!(
            report.ranges,
            vec![LineRange::new(1, 94), LineRange::new(95, 200)]
        );
        assert!(report.changed());
        assert!(matches!(
            report.decisions[0].action,
            BoundaryAction::Shifted { new_start: 95, .. }
        ));
    }

    #[tokio::test]
    async fn test_low_certainty_keeps_boundary() {
        let dir = TempDir::new().unwrap();
        let ledger = ledger(&dir);
        // Four low-certainty verdicts: initial + three retries
        let provider = ScriptedProvider::new(vec![
            verdict(false, false, Some("## Entry of 4 March"), 30);
            4
        ]);
        let refiner = BoundaryRefiner::new(
            &provider,
            &ledger,
            "gpt-4o-mini",
            "entries",
            RefinementConfig::default(),
        );

        let source = marker_source();
        let ranges = vec![LineRange::new(1, 99), LineRange::new(100, 200)];
        let report = refiner.refine(&source, &ranges).await.unwrap();

        assert_eq!(report.ranges, ranges);
        assert!(matches!(
            report.decisions[0].action,
            BoundaryAction::Kept { .. }
        ));
        assert_eq!(report.decisions[0].queries, 4);
    }

    #[tokio::test]
    async fn test_context_expansion_then_shift() {
        let dir = TempDir::new().unwrap();
        let ledger = ledger(&dir);
        let provider = ScriptedProvider::new(vec![
            verdict(false, true, None, 40),
            verdict(false, false, Some("## Entry of 4 March"), 95),
        ]);
        let config = RefinementConfig {
            window_lines: 3,
            ..RefinementConfig::default()
        };
        let refiner =
            BoundaryRefiner::new(&provider, &ledger, "gpt-4o-mini", "entries", config);

        let source = marker_source();
        // Marker at 95 is outside the initial +/-3 window around 100 but
        // inside the doubled one
        let ranges = vec![LineRange::new(1, 99), LineRange::new(100, 200)];
        let report = refiner.refine(&source, &ranges).await.unwrap();

        assert!(matches!(
            report.decisions[0].action,
            BoundaryAction::Shifted { new_start: 95, .. }
        ));
        assert_eq!(report.decisions[0].queries, 2);
    }

    #[tokio::test]
    async fn test_empty_middle_range_deleted_and_absorbed() {
        let dir = TempDir::new().unwrap();
        let ledger = ledger(&dir);
        let provider = ScriptedProvider::new(vec![
            // Boundary of range 2: empty window, high certainty
            verdict(true, false, None, 95),
            // Verification scan: nothing relevant
            json!({"contains_relevant_content": false}),
        ]);
        let refiner = BoundaryRefiner::new(
            &provider,
            &ledger,
            "gpt-4o-mini",
            "entries",
            RefinementConfig::default(),
        );

        let source = numbered_source(300);
        let ranges = vec![
            LineRange::new(1, 100),
            LineRange::new(101, 200),
            LineRange::new(201, 300),
        ];
        let report = refiner.refine(&source, &ranges).await.unwrap();

        assert_eq!(
            report.ranges,
            vec![LineRange::new(1, 100), LineRange::new(101, 300)]
        );
        assert!(matches!(report.decisions[0].action, BoundaryAction::Deleted));
    }

    #[tokio::test]
    async fn test_relevant_content_blocks_deletion() {
        let dir = TempDir::new().unwrap();
        let ledger = ledger(&dir);
        let provider = ScriptedProvider::new(vec![
            // Middle range: declared empty, but the scan disagrees
            verdict(true, false, None, 95),
            json!({"contains_relevant_content": true}),
            // Final boundary: declared empty, skipped because it is last
            verdict(true, false, None, 95),
        ]);
        let refiner = BoundaryRefiner::new(
            &provider,
            &ledger,
            "gpt-4o-mini",
            "entries",
            RefinementConfig::default(),
        );

        let source = numbered_source(300);
        let ranges = vec![
            LineRange::new(1, 100),
            LineRange::new(101, 200),
            LineRange::new(201, 300),
        ];
        let report = refiner.refine(&source, &ranges).await.unwrap();

        assert_eq!(report.ranges, ranges);
        assert!(matches!(
            &report.decisions[0].action,
            BoundaryAction::Kept { reason } if reason.contains("relevant content")
        ));
    }

    #[tokio::test]
    async fn test_last_range_never_deleted() {
        let dir = TempDir::new().unwrap();
        let ledger = ledger(&dir);
        let provider = ScriptedProvider::new(vec![verdict(true, false, None, 99)]);
        let refiner = BoundaryRefiner::new(
            &provider,
            &ledger,
            "gpt-4o-mini",
            "entries",
            RefinementConfig::default(),
        );

        let source = numbered_source(200);
        let ranges = vec![LineRange::new(1, 100), LineRange::new(101, 200)];
        let report = refiner.refine(&source, &ranges).await.unwrap();

        assert_eq!(report.ranges, ranges);
        assert!(matches!(
            &report.decisions[0].action,
            BoundaryAction::Kept { reason } if reason.contains("final range")
        ));
    }

    #[tokio::test]
    async fn test_shift_clamped_to_neighbours() {
        let dir = TempDir::new().unwrap();
        let ledger = ledger(&dir);
        // Marker sits at line 95, but the previous chunk starts at 97:
        // the shift must clamp to prev_start + 1 = 98.
        let source = marker_source();
        let provider = ScriptedProvider::new(vec![verdict(
            false,
            false,
            Some("## Entry of 4 March"),
            90,
        )]);
        let refiner = BoundaryRefiner::new(
            &provider,
            &ledger,
            "gpt-4o-mini",
            "entries",
            RefinementConfig::default(),
        );
        let ranges = vec![LineRange::new(97, 99), LineRange::new(100, 200)];
        let report = refiner.refine(&source, &ranges).await.unwrap();

        assert_eq!(
            report.ranges,
            vec![LineRange::new(97, 97), LineRange::new(98, 200)]
        );
    }

    #[tokio::test]
    async fn test_provider_failure_keeps_boundary() {
        let dir = TempDir::new().unwrap();
        let ledger = ledger(&dir);
        let provider = ScriptedProvider::new(Vec::new());
        let refiner = BoundaryRefiner::new(
            &provider,
            &ledger,
            "gpt-4o-mini",
            "entries",
            RefinementConfig::default(),
        );

        let source = numbered_source(200);
        let ranges = vec![LineRange::new(1, 100), LineRange::new(101, 200)];
        let report = refiner.refine(&source, &ranges).await.unwrap();
        assert_eq!(report.ranges, ranges);
        assert!(!report.changed());
    }

    #[test]
    fn test_window_around_clamps() {
        assert_eq!(window_around(5, 10, 100), LineRange::new(1, 15));
        assert_eq!(window_around(95, 10, 100), LineRange::new(85, 100));
        assert_eq!(window_around(50, 10, 100), LineRange::new(40, 60));
    }
}
