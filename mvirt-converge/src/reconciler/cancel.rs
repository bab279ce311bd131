//! Caller-controlled cancellation and deadlines for chained loops.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use crate::error::{ConvergeError, Result};

/// Cancels every [`Cancellation`] cloned from the same pair.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

/// Cancellation signal plus an optional overall deadline.
///
/// Clones share the signal, so one handle can stop a whole chain of loops.
#[derive(Debug, Clone)]
pub struct Cancellation {
    rx: watch::Receiver<bool>,
    deadline: Option<Instant>,
}

impl Cancellation {
    pub fn new() -> (CancelHandle, Cancellation) {
        let (tx, rx) = watch::channel(false);
        (
            CancelHandle { tx },
            Cancellation { rx, deadline: None },
        )
    }

    /// A cancellation that never fires unless a deadline is added.
    pub fn never() -> Cancellation {
        Self::new().1
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        });
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Fail fast if already cancelled or past the deadline.
    pub fn check(&self) -> Result<()> {
        if *self.rx.borrow() {
            return Err(ConvergeError::Cancelled);
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(ConvergeError::DeadlineExceeded);
            }
        }
        Ok(())
    }

    /// Resolves with the reason once cancelled or past the deadline.
    async fn stopped(&self) -> ConvergeError {
        let mut rx = self.rx.clone();
        let signal = async move {
            loop {
                if *rx.borrow_and_update() {
                    return;
                }
                if rx.changed().await.is_err() {
                    // Handle dropped without cancelling.
                    std::future::pending::<()>().await;
                }
            }
        };
        match self.deadline {
            Some(deadline) => tokio::select! {
                _ = signal => ConvergeError::Cancelled,
                _ = tokio::time::sleep_until(deadline) => ConvergeError::DeadlineExceeded,
            },
            None => {
                signal.await;
                ConvergeError::Cancelled
            }
        }
    }

    /// Run `fut` unless cancellation or the deadline wins first.
    pub async fn guard<F: Future>(&self, fut: F) -> Result<F::Output> {
        self.check()?;
        tokio::select! {
            biased;
            reason = self.stopped() => Err(reason),
            out = fut => Ok(out),
        }
    }

    /// Cancellable sleep.
    pub async fn sleep(&self, duration: Duration) -> Result<()> {
        self.guard(tokio::time::sleep(duration)).await
    }
}

impl Default for Cancellation {
    fn default() -> Self {
        Self::never()
    }
}
