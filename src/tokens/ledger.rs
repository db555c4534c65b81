//! Persistent daily token ledger with midnight reset.
//!
//! The ledger is a process-wide singleton passed explicitly to the
//! scheduler and batch manager. It counts every token that crosses a
//! provider boundary against a per-calendar-day budget, persists its state
//! through an atomic rename on every mutation, and survives process
//! restarts. When the budget is exhausted, callers either wait until the
//! next local midnight (cancellable) or abort, per configuration.
//!
//! Concurrency: all mutations go through one async mutex. Multi-process
//! coordination is out of scope; the single-writer assumption holds for
//! the CLI.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, TimeDelta};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::core::CancelToken;
use crate::error::LedgerError;
use crate::io::atomic_write_file;

/// Persisted ledger state, one JSON object in the state file.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LedgerState {
    /// Local calendar day the counter belongs to (`YYYY-MM-DD`).
    date_local: String,
    /// Tokens reserved or committed so far today.
    tokens_used: u64,
    /// Configured daily limit at the time of the last write.
    limit: u64,
    /// RFC 3339 timestamp of the last update.
    last_updated: String,
}

/// Outcome of a reservation attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReserveOutcome {
    /// The reservation fits; tokens were added to today's counter.
    Granted,
    /// The budget is exhausted until the next local midnight.
    Wait {
        /// When the counter resets.
        resets_at: DateTime<Local>,
    },
}

/// Daily token budget, persisted across restarts.
///
/// Constructed disabled (all operations no-ops) when no limit is
/// configured.
#[derive(Debug)]
pub struct DailyLedger {
    path: PathBuf,
    limit: Option<u64>,
    state: Mutex<LedgerState>,
}

impl DailyLedger {
    /// Opens the ledger, loading persisted state when present.
    ///
    /// A malformed state file is discarded with a warning rather than
    /// failing the run; the counter restarts at zero for today.
    #[must_use]
    pub fn open<P: AsRef<Path>>(path: P, limit: Option<u64>) -> Self {
        let path = path.as_ref().to_path_buf();
        let state = load_state(&path, limit.unwrap_or(0))
            .unwrap_or_else(|| fresh_state(limit.unwrap_or(0)));
        Self {
            path,
            limit,
            state: Mutex::new(state),
        }
    }

    /// Whether budget enforcement is active.
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.limit.is_some()
    }

    /// Returns `(tokens_used, limit, date_local)` for today.
    pub async fn current_usage(&self) -> (u64, u64, String) {
        let Some(limit) = self.limit else {
            return (0, 0, today());
        };
        let mut state = self.state.lock().await;
        reset_if_new_day(&mut state);
        (state.tokens_used, limit, state.date_local.clone())
    }

    /// Attempts to reserve `estimated` tokens against today's budget.
    ///
    /// On success the estimate is added to the counter immediately;
    /// [`DailyLedger::commit`] later replaces it with the actual usage.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::EstimateExceedsLimit`] when the request can
    /// never fit, and [`LedgerError::Persistence`] when the state file
    /// cannot be written.
    pub async fn reserve(&self, estimated: u64) -> Result<ReserveOutcome, LedgerError> {
        let Some(limit) = self.limit else {
            return Ok(ReserveOutcome::Granted);
        };
        if estimated > limit {
            return Err(LedgerError::EstimateExceedsLimit { estimated, limit });
        }

        let mut state = self.state.lock().await;
        reset_if_new_day(&mut state);

        if state.tokens_used + estimated <= limit {
            state.tokens_used += estimated;
            persist(&self.path, &mut state, limit)?;
            debug!(
                reserved = estimated,
                used = state.tokens_used,
                limit,
                "token reservation granted"
            );
            Ok(ReserveOutcome::Granted)
        } else {
            Ok(ReserveOutcome::Wait {
                resets_at: next_local_midnight(Local::now()),
            })
        }
    }

    /// Replaces a prior reservation with the actual usage.
    ///
    /// If the day rolled over between reserve and commit, the reservation
    /// was zeroed by the reset and only the actual usage is charged to the
    /// new day.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Persistence`] when the state file cannot be
    /// written.
    pub async fn commit(&self, estimated: u64, actual: u64) -> Result<(), LedgerError> {
        let Some(limit) = self.limit else {
            return Ok(());
        };

        let mut state = self.state.lock().await;
        reset_if_new_day(&mut state);

        state.tokens_used = state.tokens_used.saturating_sub(estimated) + actual;
        if state.tokens_used > limit {
            warn!(
                used = state.tokens_used,
                limit, "actual usage pushed the ledger past its limit"
            );
        }
        persist(&self.path, &mut state, limit)?;
        debug!(
            estimated,
            actual,
            used = state.tokens_used,
            "token usage committed"
        );
        Ok(())
    }

    /// Sleeps until `resets_at`, returning early on cancellation.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::WaitCancelled`] when the token fires first.
    pub async fn wait_for_reset(
        &self,
        resets_at: DateTime<Local>,
        cancel: &CancelToken,
    ) -> Result<(), LedgerError> {
        let remaining = (resets_at - Local::now())
            .to_std()
            .unwrap_or(std::time::Duration::ZERO);
        warn!(
            resets_at = %resets_at.to_rfc3339(),
            wait_secs = remaining.as_secs(),
            "daily token limit reached, waiting for reset"
        );
        tokio::select! {
            () = tokio::time::sleep(remaining) => Ok(()),
            () = cancel.cancelled() => Err(LedgerError::WaitCancelled),
        }
    }

    /// Reserves `estimated` tokens, blocking across midnight resets until
    /// the reservation fits.
    ///
    /// With `no_wait` set, an exhausted budget surfaces immediately as
    /// [`LedgerError::LimitReached`] instead of sleeping.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::LimitReached`] in non-blocking mode,
    /// [`LedgerError::WaitCancelled`] when cancelled mid-wait, and
    /// persistence errors from the underlying reserve.
    pub async fn acquire(
        &self,
        estimated: u64,
        no_wait: bool,
        cancel: &CancelToken,
    ) -> Result<(), LedgerError> {
        loop {
            match self.reserve(estimated).await? {
                ReserveOutcome::Granted => return Ok(()),
                ReserveOutcome::Wait { resets_at } => {
                    if no_wait {
                        return Err(self.limit_error(resets_at).await);
                    }
                    self.wait_for_reset(resets_at, cancel).await?;
                }
            }
        }
    }

    /// Builds the error surfaced in non-blocking mode.
    pub async fn limit_error(&self, resets_at: DateTime<Local>) -> LedgerError {
        let (used, limit, _) = self.current_usage().await;
        LedgerError::LimitReached {
            used,
            limit,
            resets_at: resets_at.to_rfc3339(),
        }
    }
}

/// Loads persisted state, discarding mismatched or unreadable files.
fn load_state(path: &Path, limit: u64) -> Option<LedgerState> {
    if !path.exists() {
        return None;
    }
    match std::fs::read_to_string(path) {
        Ok(raw) => match serde_json::from_str::<LedgerState>(&raw) {
            Ok(mut state) => {
                state.limit = limit;
                Some(state)
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "discarding malformed ledger state");
                None
            }
        },
        Err(e) => {
            warn!(path = %path.display(), error = %e, "could not read ledger state");
            None
        }
    }
}

fn fresh_state(limit: u64) -> LedgerState {
    LedgerState {
        date_local: today(),
        tokens_used: 0,
        limit,
        last_updated: Local::now().to_rfc3339(),
    }
}

/// Zeroes the counter when the persisted day is not today.
fn reset_if_new_day(state: &mut LedgerState) {
    let current = today();
    if state.date_local != current {
        debug!(
            previous = %state.date_local,
            current = %current,
            "daily ledger reset"
        );
        state.date_local = current;
        state.tokens_used = 0;
    }
}

/// Writes the state file via atomic rename.
fn persist(path: &Path, state: &mut LedgerState, limit: u64) -> Result<(), LedgerError> {
    state.limit = limit;
    state.last_updated = Local::now().to_rfc3339();
    let json = serde_json::to_string_pretty(state).map_err(|e| LedgerError::Persistence {
        path: path.to_string_lossy().to_string(),
        reason: e.to_string(),
    })?;
    atomic_write_file(path, &json).map_err(|e| LedgerError::Persistence {
        path: path.to_string_lossy().to_string(),
        reason: e.to_string(),
    })
}

fn today() -> String {
    Local::now().date_naive().to_string()
}

/// Computes the next local midnight after `now`.
fn next_local_midnight(now: DateTime<Local>) -> DateTime<Local> {
    now.date_naive()
        .succ_opt()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .and_then(|naive| naive.and_local_timezone(Local).earliest())
        .unwrap_or_else(|| now + TimeDelta::hours(24))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn ledger_path(dir: &TempDir) -> PathBuf {
        dir.path().join(".chronominer_token_state.json")
    }

    #[tokio::test]
    async fn test_disabled_ledger_is_noop() {
        let dir = TempDir::new().unwrap();
        let ledger = DailyLedger::open(ledger_path(&dir), None);
        assert!(!ledger.is_enabled());
        assert_eq!(
            ledger.reserve(1_000_000).await.unwrap(),
            ReserveOutcome::Granted
        );
        ledger.commit(1_000_000, 999).await.unwrap();
        assert!(!ledger_path(&dir).exists());
    }

    #[tokio::test]
    async fn test_reserve_within_limit() {
        let dir = TempDir::new().unwrap();
        let ledger = DailyLedger::open(ledger_path(&dir), Some(1_000));
        assert_eq!(ledger.reserve(400).await.unwrap(), ReserveOutcome::Granted);
        let (used, limit, _) = ledger.current_usage().await;
        assert_eq!(used, 400);
        assert_eq!(limit, 1_000);
    }

    #[tokio::test]
    async fn test_reserve_over_limit_returns_wait() {
        let dir = TempDir::new().unwrap();
        let ledger = DailyLedger::open(ledger_path(&dir), Some(1_000));
        assert_eq!(ledger.reserve(900).await.unwrap(), ReserveOutcome::Granted);
        match ledger.reserve(200).await.unwrap() {
            ReserveOutcome::Wait { resets_at } => {
                assert!(resets_at > Local::now());
            }
            ReserveOutcome::Granted => unreachable!("reservation must not fit"),
        }
        // Counter unchanged by the refused reservation
        let (used, _, _) = ledger.current_usage().await;
        assert_eq!(used, 900);
    }

    #[tokio::test]
    async fn test_estimate_exceeding_whole_limit_errors() {
        let dir = TempDir::new().unwrap();
        let ledger = DailyLedger::open(ledger_path(&dir), Some(100));
        let err = ledger.reserve(500).await.unwrap_err();
        assert!(matches!(err, LedgerError::EstimateExceedsLimit { .. }));
    }

    #[tokio::test]
    async fn test_commit_replaces_reservation() {
        let dir = TempDir::new().unwrap();
        let ledger = DailyLedger::open(ledger_path(&dir), Some(10_000));
        ledger.reserve(5_000).await.unwrap();
        ledger.commit(5_000, 3_200).await.unwrap();
        let (used, _, _) = ledger.current_usage().await;
        assert_eq!(used, 3_200);
    }

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = ledger_path(&dir);
        {
            let ledger = DailyLedger::open(&path, Some(10_000));
            ledger.reserve(1_234).await.unwrap();
        }
        let reopened = DailyLedger::open(&path, Some(10_000));
        let (used, _, date) = reopened.current_usage().await;
        assert_eq!(used, 1_234);
        assert_eq!(date, today());
    }

    #[tokio::test]
    async fn test_stale_date_resets_on_read() {
        let dir = TempDir::new().unwrap();
        let path = ledger_path(&dir);
        let stale = LedgerState {
            date_local: "2001-01-01".to_string(),
            tokens_used: 9_999,
            limit: 10_000,
            last_updated: "2001-01-01T23:59:59+00:00".to_string(),
        };
        std::fs::write(&path, serde_json::to_string(&stale).unwrap()).unwrap();

        let ledger = DailyLedger::open(&path, Some(10_000));
        let (used, _, date) = ledger.current_usage().await;
        assert_eq!(used, 0);
        assert_eq!(date, today());
    }

    #[tokio::test]
    async fn test_malformed_state_discarded() {
        let dir = TempDir::new().unwrap();
        let path = ledger_path(&dir);
        std::fs::write(&path, "{not json").unwrap();
        let ledger = DailyLedger::open(&path, Some(500));
        let (used, limit, _) = ledger.current_usage().await;
        assert_eq!(used, 0);
        assert_eq!(limit, 500);
    }

    #[tokio::test]
    async fn test_wait_for_reset_cancellable() {
        let dir = TempDir::new().unwrap();
        let ledger = DailyLedger::open(ledger_path(&dir), Some(100));
        let (handle, token) = CancelToken::pair();
        let far_future = Local::now() + TimeDelta::hours(12);
        handle.cancel();
        let err = ledger.wait_for_reset(far_future, &token).await.unwrap_err();
        assert!(matches!(err, LedgerError::WaitCancelled));
    }

    #[tokio::test]
    async fn test_acquire_no_wait_surfaces_limit() {
        let dir = TempDir::new().unwrap();
        let ledger = DailyLedger::open(ledger_path(&dir), Some(1_000));
        ledger.reserve(900).await.unwrap();
        let err = ledger
            .acquire(500, true, &CancelToken::never())
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::LimitReached { .. }));
    }

    #[tokio::test]
    async fn test_acquire_granted_when_budget_fits() {
        let dir = TempDir::new().unwrap();
        let ledger = DailyLedger::open(ledger_path(&dir), Some(1_000));
        ledger
            .acquire(400, true, &CancelToken::never())
            .await
            .unwrap();
        let (used, _, _) = ledger.current_usage().await;
        assert_eq!(used, 400);
    }

    #[test]
    fn test_next_local_midnight_is_tomorrow() {
        let now = Local::now();
        let midnight = next_local_midnight(now);
        assert!(midnight > now);
        assert_eq!(
            midnight.date_naive(),
            now.date_naive().succ_opt().unwrap()
        );
    }

    #[tokio::test]
    async fn test_commit_after_day_rollover_charges_only_actual() {
        let dir = TempDir::new().unwrap();
        let path = ledger_path(&dir);
        // Simulate a reservation persisted yesterday
        let stale = LedgerState {
            date_local: "2001-01-01".to_string(),
            tokens_used: 5_000,
            limit: 10_000,
            last_updated: "2001-01-01T23:59:59+00:00".to_string(),
        };
        std::fs::write(&path, serde_json::to_string(&stale).unwrap()).unwrap();

        let ledger = DailyLedger::open(&path, Some(10_000));
        // The reset zeroes the stale counter; subtracting the old estimate
        // saturates instead of underflowing.
        ledger.commit(5_000, 700).await.unwrap();
        let (used, _, _) = ledger.current_usage().await;
        assert_eq!(used, 700);
    }
}
