//! Output formatting for CLI commands.
//!
//! Supports text and JSON output formats.

use std::fmt::Write;

use serde::Serialize;

use crate::batch::{PollOutcome, RepairOutcome};
use crate::chunking::{BoundaryAction, RefinementReport};
use crate::error::Error;
use crate::extract::{FileReport, RunMode};

/// Output format options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable text output.
    Text,
    /// JSON output.
    Json,
}

impl OutputFormat {
    /// Parses format from string.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "json" => Self::Json,
            _ => Self::Text,
        }
    }
}

/// Formats per-file run reports.
#[must_use]
pub fn format_reports(reports: &[FileReport], format: OutputFormat) -> String {
    match format {
        OutputFormat::Text => format_reports_text(reports),
        OutputFormat::Json => {
            #[derive(Serialize)]
            struct ReportRow<'a> {
                file: String,
                chunks: usize,
                succeeded: usize,
                failed: usize,
                partial: bool,
                mode: &'a str,
                batch_id: Option<&'a str>,
                tokens: u64,
                resumed: bool,
            }
            let rows: Vec<ReportRow<'_>> = reports
                .iter()
                .map(|r| ReportRow {
                    file: r.file.to_string_lossy().to_string(),
                    chunks: r.chunk_count,
                    succeeded: r.succeeded,
                    failed: r.failed,
                    partial: r.partial,
                    mode: mode_name(r.mode),
                    batch_id: r.batch_id.as_deref(),
                    tokens: r.usage.total(),
                    resumed: r.resumed,
                })
                .collect();
            format_json(&rows)
        }
    }
}

fn format_reports_text(reports: &[FileReport]) -> String {
    if reports.is_empty() {
        return "No files processed.\n".to_string();
    }

    let mut output = String::new();
    let _ = writeln!(
        output,
        "{:<32} {:<7} {:<6} {:<6} {:<8} {:<10} Tokens",
        "File", "Chunks", "Ok", "Fail", "Mode", "Status"
    );
    output.push_str(&"-".repeat(84));
    output.push('\n');

    let mut total_tokens = 0u64;
    for report in reports {
        let name = report
            .file
            .file_name()
            .map_or_else(|| report.stem.clone(), |n| n.to_string_lossy().to_string());
        let status = if report.mode == RunMode::Batch {
            "submitted"
        } else if report.resumed {
            "resumed"
        } else if report.partial {
            "partial"
        } else {
            "complete"
        };
        total_tokens += report.usage.total();
        let _ = writeln!(
            output,
            "{:<32} {:<7} {:<6} {:<6} {:<8} {:<10} {}",
            truncate(&name, 32),
            report.chunk_count,
            report.succeeded,
            report.failed,
            mode_name(report.mode),
            status,
            report.usage.total()
        );
        if let Some(batch_id) = &report.batch_id {
            let _ = writeln!(output, "    batch: {batch_id}");
        }
    }

    let _ = writeln!(output, "\n{} file(s), {total_tokens} tokens", reports.len());
    output
}

const fn mode_name(mode: RunMode) -> &'static str {
    match mode {
        RunMode::Sync => "sync",
        RunMode::Batch => "batch",
    }
}

/// Formats batch poll outcomes per journal.
#[must_use]
pub fn format_poll_outcomes(
    outcomes: &[(String, Vec<PollOutcome>)],
    format: OutputFormat,
) -> String {
    match format {
        OutputFormat::Text => {
            if outcomes.iter().all(|(_, polls)| polls.is_empty()) {
                return "No open batches.\n".to_string();
            }
            let mut output = String::new();
            for (stem, polls) in outcomes {
                for poll in polls {
                    let _ = writeln!(
                        output,
                        "{:<32} {:<20} {:<12} ingested {}",
                        truncate(stem, 32),
                        truncate(&poll.batch_id, 20),
                        poll.status.to_string(),
                        poll.ingested
                    );
                }
            }
            output
        }
        OutputFormat::Json => {
            #[derive(Serialize)]
            struct PollRow<'a> {
                file_stem: &'a str,
                batch_id: &'a str,
                status: String,
                ingested: usize,
            }
            let rows: Vec<PollRow<'_>> = outcomes
                .iter()
                .flat_map(|(stem, polls)| {
                    polls.iter().map(move |poll| PollRow {
                        file_stem: stem,
                        batch_id: &poll.batch_id,
                        status: poll.status.to_string(),
                        ingested: poll.ingested,
                    })
                })
                .collect();
            format_json(&rows)
        }
    }
}

/// Formats a refinement report (readjust-line-ranges).
#[must_use]
pub fn format_refinement(
    report: &RefinementReport,
    dry_run: bool,
    format: OutputFormat,
) -> String {
    match format {
        OutputFormat::Text => {
            let mut output = String::new();
            for decision in &report.decisions {
                let line = match &decision.action {
                    BoundaryAction::Shifted { new_start, marker } => format!(
                        "boundary {} -> {} (marker: {})",
                        decision.original_start,
                        new_start,
                        truncate(marker, 40)
                    ),
                    BoundaryAction::Deleted => {
                        format!("boundary {}: range deleted", decision.original_start)
                    }
                    BoundaryAction::Kept { reason } => format!(
                        "boundary {}: kept ({})",
                        decision.original_start,
                        truncate(reason, 60)
                    ),
                };
                let _ = writeln!(output, "{line}");
            }
            let ranges: Vec<String> = report.ranges.iter().map(ToString::to_string).collect();
            let _ = writeln!(output, "\nranges: {}", ranges.join(", "));
            if dry_run {
                output.push_str("(dry run, range file not rewritten)\n");
            }
            output
        }
        OutputFormat::Json => {
            #[derive(Serialize)]
            struct DecisionRow {
                original_start: usize,
                action: String,
                queries: u32,
            }
            #[derive(Serialize)]
            struct RefinementOut {
                decisions: Vec<DecisionRow>,
                ranges: Vec<String>,
                dry_run: bool,
            }
            let decisions = report
                .decisions
                .iter()
                .map(|d| DecisionRow {
                    original_start: d.original_start,
                    action: match &d.action {
                        BoundaryAction::Shifted { new_start, .. } => {
                            format!("shifted:{new_start}")
                        }
                        BoundaryAction::Deleted => "deleted".to_string(),
                        BoundaryAction::Kept { .. } => "kept".to_string(),
                    },
                    queries: d.queries,
                })
                .collect();
            format_json(&RefinementOut {
                decisions,
                ranges: report.ranges.iter().map(ToString::to_string).collect(),
                dry_run,
            })
        }
    }
}

/// Formats repair outcomes.
#[must_use]
pub fn format_repairs(outcomes: &[RepairOutcome], format: OutputFormat) -> String {
    match format {
        OutputFormat::Text => {
            if outcomes.is_empty() {
                return "Nothing to repair.\n".to_string();
            }
            let mut output = String::new();
            for outcome in outcomes {
                let state = if outcome.complete { "complete" } else { "incomplete" };
                let _ = writeln!(output, "{} [{state}]", outcome.stem);
                for action in &outcome.actions {
                    let line = match action {
                        crate::batch::RepairAction::BatchPolled {
                            batch_id,
                            status,
                            ingested,
                        } => format!("  batch {batch_id}: {status}, ingested {ingested}"),
                        crate::batch::RepairAction::ChunksRequeued { count } => {
                            format!("  re-queued {count} chunk(s)")
                        }
                        crate::batch::RepairAction::AlreadyComplete => {
                            "  nothing to do".to_string()
                        }
                    };
                    let _ = writeln!(output, "{line}");
                }
            }
            output
        }
        OutputFormat::Json => {
            #[derive(Serialize)]
            struct RepairRow<'a> {
                file_stem: &'a str,
                complete: bool,
                actions: Vec<String>,
            }
            let rows: Vec<RepairRow<'_>> = outcomes
                .iter()
                .map(|o| RepairRow {
                    file_stem: &o.stem,
                    complete: o.complete,
                    actions: o.actions.iter().map(|a| format!("{a:?}")).collect(),
                })
                .collect();
            format_json(&rows)
        }
    }
}

/// Formats an error for the configured output format.
#[must_use]
pub fn format_error(error: &Error, format: OutputFormat) -> String {
    match format {
        OutputFormat::Text => error.to_string(),
        OutputFormat::Json => {
            #[derive(Serialize)]
            struct ErrorOut {
                error: String,
            }
            format_json(&ErrorOut {
                error: error.to_string(),
            })
        }
    }
}

/// Serializes any value as pretty JSON, with a fallback error object.
fn format_json<T: Serialize>(value: &T) -> String {
    serde_json::to_string_pretty(value)
        .unwrap_or_else(|e| format!("{{\"error\": \"serialization failed: {e}\"}}"))
}

/// Truncates a string for column display.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max_len.saturating_sub(1)).collect();
        format!("{truncated}…")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::TokenUsage;
    use std::path::PathBuf;

    fn report() -> FileReport {
        FileReport {
            file: PathBuf::from("/data/diary_1898.txt"),
            stem: "diary_1898".to_string(),
            chunk_count: 3,
            succeeded: 2,
            failed: 1,
            partial: true,
            usage: TokenUsage {
                input: 100,
                cached_input: 0,
                output: 20,
                reasoning: 0,
            },
            mode: RunMode::Sync,
            batch_id: None,
            aggregate_path: None,
            resumed: false,
        }
    }

    #[test]
    fn test_format_reports_text() {
        let output = format_reports(&[report()], OutputFormat::Text);
        assert!(output.contains("diary_1898.txt"));
        assert!(output.contains("partial"));
        assert!(output.contains("120"));
        assert!(output.contains("1 file(s)"));
    }

    #[test]
    fn test_format_reports_json() {
        let output = format_reports(&[report()], OutputFormat::Json);
        let parsed: serde_json::Value = serde_json::from_str(&output).unwrap();
        assert_eq!(parsed[0]["succeeded"], 2);
        assert_eq!(parsed[0]["partial"], true);
        assert_eq!(parsed[0]["mode"], "sync");
    }

    #[test]
    fn test_format_reports_empty() {
        assert_eq!(
            format_reports(&[], OutputFormat::Text),
            "No files processed.\n"
        );
    }

    #[test]
    fn test_format_error_json() {
        let error = Error::Config {
            message: "broken".to_string(),
        };
        let output = format_error(&error, OutputFormat::Json);
        let parsed: serde_json::Value = serde_json::from_str(&output).unwrap();
        assert!(parsed["error"].as_str().unwrap().contains("broken"));
    }

    #[test]
    fn test_output_format_parse() {
        assert_eq!(OutputFormat::parse("json"), OutputFormat::Json);
        assert_eq!(OutputFormat::parse("JSON"), OutputFormat::Json);
        assert_eq!(OutputFormat::parse("text"), OutputFormat::Text);
        assert_eq!(OutputFormat::parse("anything"), OutputFormat::Text);
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        let long = truncate("a very long file name indeed", 10);
        assert!(long.chars().count() <= 10);
        assert!(long.ends_with('…'));
    }

    #[test]
    fn test_format_poll_outcomes_empty() {
        let output = format_poll_outcomes(&[], OutputFormat::Text);
        assert_eq!(output, "No open batches.\n");
    }
}
