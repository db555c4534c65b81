//! Cooperative cancellation for long-running pipeline work.
//!
//! A [`CancelToken`] is handed to workers and long waits (backoff sleeps,
//! the daily-limit wait); the matching [`CancelHandle`] flips it once,
//! after which every clone observes cancellation at its next suspension
//! point.

use tokio::sync::watch;

/// Sender side of a cancellation signal.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    /// Signals cancellation to every associated [`CancelToken`].
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

/// Receiver side of a cancellation signal. Cheap to clone.
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
    // Keeps the channel open for tokens created without a handle.
    _keepalive: Option<std::sync::Arc<watch::Sender<bool>>>,
}

impl CancelToken {
    /// Creates a linked handle/token pair.
    #[must_use]
    pub fn pair() -> (CancelHandle, Self) {
        let (tx, rx) = watch::channel(false);
        (
            CancelHandle { tx },
            Self {
                rx,
                _keepalive: None,
            },
        )
    }

    /// Creates a token that never fires. Useful for tests and
    /// non-interactive runs.
    #[must_use]
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            rx,
            _keepalive: Some(std::sync::Arc::new(tx)),
        }
    }

    /// Whether cancellation has been signalled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is signalled.
    ///
    /// Also resolves if the handle is dropped without cancelling, so a
    /// worker never waits on a dead channel.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}
