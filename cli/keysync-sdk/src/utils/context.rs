use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::providers::ClientError;

/// Request-scoped context carried through every outbound call.
///
/// Carries a request id (one per pipeline run, logged with every event),
/// an absolute deadline, and a cancellation token. Child contexts inherit
/// the request id and cancellation and may tighten the deadline, never
/// extend it.
#[derive(Debug, Clone)]
pub struct RequestContext {
    request_id: Uuid,
    deadline: Option<Instant>,
    cancel: CancellationToken,
}

impl RequestContext {
    pub fn new() -> Self {
        Self {
            request_id: Uuid::new_v4(),
            deadline: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        let mut ctx = Self::new();
        ctx.deadline = Some(Instant::now() + timeout);
        ctx
    }

    /// A child context with a deadline no later than `timeout` from now.
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(existing) => existing.min(candidate),
            None => candidate,
        };
        Self {
            request_id: self.request_id,
            deadline: Some(deadline),
            cancel: self.cancel.child_token(),
        }
    }

    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Remaining time budget, if a deadline is set.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when the context is cancelled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }

    /// Fails with [`ClientError::Cancelled`] once the context is cancelled
    /// or its deadline has passed. Called at every yield point.
    pub fn check(&self) -> Result<(), ClientError> {
        if self.cancel.is_cancelled() {
            return Err(ClientError::Cancelled);
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(ClientError::Cancelled);
            }
        }
        Ok(())
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}
