//! Cancellation and deadline context passed to every check and API call.

use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[cfg(test)]
#[path = "context_tests.rs"]
mod tests;

/// Reason an operation was stopped before it completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Interrupted {
    #[error("operation cancelled")]
    Cancelled,

    #[error("deadline exceeded")]
    DeadlineExceeded,
}

/// Explicit execution context for verifiers, management calls and the
/// apply engine.
///
/// Carries a cancellation token and an optional deadline. Cloning shares the
/// same token, so cancelling any clone stops every operation using it.
#[derive(Debug, Clone)]
pub struct CheckContext {
    cancellation: CancellationToken,
    deadline: Option<Instant>,
}

impl CheckContext {
    /// Create a context with no deadline.
    pub fn new() -> Self {
        Self {
            cancellation: CancellationToken::new(),
            deadline: None,
        }
    }

    /// Create a context that expires `timeout` from now.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::new().with_deadline(Instant::now() + timeout)
    }

    /// Replace the deadline.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Replace the cancellation token, e.g. to tie the context to a
    /// Ctrl-C handler owned by the caller.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Derive a context whose token is cancelled with this one but can also
    /// be cancelled on its own. The deadline is the earlier of the two.
    pub fn child(&self, timeout: Option<Duration>) -> Self {
        let deadline = match (self.deadline, timeout.map(|t| Instant::now() + t)) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        Self {
            cancellation: self.cancellation.child_token(),
            deadline,
        }
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Cancel every operation running under this context.
    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Drive `operation` to completion unless the context is cancelled or
    /// its deadline passes first.
    pub async fn run<F, T, E>(&self, operation: F) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
        E: From<Interrupted>,
    {
        if self.is_cancelled() {
            return Err(Interrupted::Cancelled.into());
        }
        if matches!(self.deadline, Some(d) if d <= Instant::now()) {
            return Err(Interrupted::DeadlineExceeded.into());
        }

        tokio::select! {
            biased;
            _ = self.cancellation.cancelled() => Err(Interrupted::Cancelled.into()),
            _ = wait_for_deadline(self.deadline) => Err(Interrupted::DeadlineExceeded.into()),
            result = operation => result,
        }
    }
}

impl Default for CheckContext {
    fn default() -> Self {
        Self::new()
    }
}

async fn wait_for_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}
