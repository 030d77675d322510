//! Caller-abort propagation.
//!
//! The handler holds a [`CancelOnDrop`] guard for the lifetime of the
//! request future; in-flight upstream attempts and backoff sleeps select
//! against the paired [`CancelSignal`]. A dropped handle counts as a
//! cancellation, so an aborted caller connection tears the upstream call
//! down without any explicit signal.

use tokio::sync::watch;

pub fn cancel_pair() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelSignal { rx })
}

#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

/// Fires the cancellation when dropped.
#[derive(Debug)]
pub struct CancelOnDrop(pub CancelHandle);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow() || self.rx.has_changed().is_err()
    }

    /// Resolves once the caller aborts (or the handle is dropped).
    pub async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow() {
                return;
            }
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}
