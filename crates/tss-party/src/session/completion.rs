//! Single-resolution completion signal
//!
//! Bridges the session driver task and the caller suspended in
//! `keygen`/`sign`. Resolving consumes the signal, so a session can only ever
//! report one terminal outcome.

use crate::{Error, Result};
use tokio::sync::oneshot;
use tracing::debug;

/// Resolving half, owned by the session driver
#[derive(Debug)]
pub struct CompletionSignal<T> {
    tx: oneshot::Sender<Result<T>>,
}

/// Waiting half, owned by the blocked caller
#[derive(Debug)]
pub struct Completion<T> {
    rx: oneshot::Receiver<Result<T>>,
}

/// Create a linked signal/completion pair
pub fn completion_signal<T>() -> (CompletionSignal<T>, Completion<T>) {
    let (tx, rx) = oneshot::channel();
    (CompletionSignal { tx }, Completion { rx })
}

impl<T> CompletionSignal<T> {
    /// Resolve with the terminal outcome.
    ///
    /// Returns `false` when nobody is waiting any more (the caller gave up).
    pub fn resolve(self, outcome: Result<T>) -> bool {
        let delivered = self.tx.send(outcome).is_ok();
        if !delivered {
            debug!("Completion resolved after the waiter went away");
        }
        delivered
    }
}

impl<T> Completion<T> {
    /// Wait for the session outcome
    pub async fn wait(self) -> Result<T> {
        self.rx.await.unwrap_or_else(|_| {
            Err(Error::Internal(
                "Session ended without reporting an outcome".into(),
            ))
        })
    }
}
