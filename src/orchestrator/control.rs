use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Interrupted {
    #[error("tool call cancelled by caller")]
    Cancelled,
    #[error("tool call deadline exceeded")]
    DeadlineExceeded,
}

/// Caller-supplied cancellation signal plus an optional deadline. Cloning shares
/// the same token, so one control can govern every task of a batch.
#[derive(Debug, Clone, Default)]
pub struct RunControl {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl RunControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn check(&self) -> Result<(), Interrupted> {
        if self.cancel.is_cancelled() {
            return Err(Interrupted::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(Interrupted::DeadlineExceeded),
            _ => Ok(()),
        }
    }

    /// Races `work` against cancellation and the deadline.
    pub async fn guard<F>(&self, work: F) -> Result<F::Output, Interrupted>
    where
        F: Future,
    {
        self.check()?;
        let deadline = self.deadline;
        let expiry = async move {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Interrupted::Cancelled),
            _ = expiry => Err(Interrupted::DeadlineExceeded),
            output = work => Ok(output),
        }
    }

    pub async fn sleep(&self, delay: Duration) -> Result<(), Interrupted> {
        if delay.is_zero() {
            return self.check();
        }
        self.guard(tokio::time::sleep(delay)).await
    }
}
