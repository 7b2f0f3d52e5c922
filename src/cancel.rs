//! Cooperative cancellation token, checked before network calls and between
//! poll iterations (spec §5/§6.5).

use tokio::sync::watch;

/// Read-only side, cloned freely and handed to every component of a run.
#[derive(Clone, Debug)]
pub struct CancellationToken {
    rx: watch::Receiver<bool>,
    // Keeps the channel open for tokens with no corresponding `CancellationHandle`
    // (see `never`); a closed sender makes `changed()` return `Err` immediately,
    // which would make `cancelled()` resolve spuriously.
    _keep_alive: Option<std::sync::Arc<watch::Sender<bool>>>,
}

/// Write side, held by the caller; dropping it leaves the token uncancelled
/// forever (no accidental cancellation on drop).
#[derive(Debug)]
pub struct CancellationHandle {
    tx: watch::Sender<bool>,
}

impl CancellationToken {
    /// A fresh token/handle pair, starting not-cancelled.
    pub fn new() -> (Self, CancellationHandle) {
        let (tx, rx) = watch::channel(false);
        (Self { rx, _keep_alive: None }, CancellationHandle { tx })
    }

    /// A token that can never be cancelled, for callers that don't need one.
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { rx, _keep_alive: Some(std::sync::Arc::new(tx)) }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the token is cancelled. Never resolves otherwise.
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

impl CancellationHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}
