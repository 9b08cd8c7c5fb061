//! Cooperative cancellation.
//!
//! A [`CancelToken`] is passed by parameter through every suspension point
//! (target call, backoff sleep, single-flight wait). Work observes it at
//! checkpoints; nothing is interrupted preemptively.

use std::sync::Arc;

use tokio::sync::watch;

use crate::error::CallError;

#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Checkpoint: `Err(Cancelled)` once cancellation was requested.
    pub fn checkpoint(&self) -> Result<(), CallError> {
        if self.is_cancelled() {
            Err(CallError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Resolves once cancellation is requested.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|cancelled| *cancelled).await.is_err() {
            // Sender lives in `self`, so this branch cannot be reached while
            // the token is alive; never resolve rather than fake a cancel.
            std::future::pending::<()>().await;
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn checkpoint_flips_after_cancel() {
        let token = CancelToken::new();
        assert!(token.checkpoint().is_ok());
        token.clone().cancel();
        assert_eq!(token.checkpoint(), Err(CallError::Cancelled));
        token.cancel();
        assert!(token.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_wakes_waiters() {
        let token = CancelToken::new();
        let waiter = {
            let token = token.clone();
            tokio::spawn(async move { token.cancelled().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());
        token.cancel();
        waiter.await.unwrap();
    }
}
