//! Retry decisions and the global retry budget.

pub mod budget;

use std::sync::Arc;

use hyper::Method;
use tracing::debug;

pub use budget::RetryBudget;

use crate::proxy::router::ForwardError;

/// Decides whether a failed attempt may be retried.
///
/// A retry requires, in order: the client has not cancelled, attempts
/// remain, the method is idempotent, the failure class is retryable, and
/// the global budget yields a token. The budget is consulted last so a
/// categorically non-retryable failure never spends a token.
#[derive(Debug)]
pub struct RetryPolicy {
    max_attempts: u32,
    budget: Arc<RetryBudget>,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, budget: Arc<RetryBudget>) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            budget,
        }
    }

    /// Total attempts allowed per request (original + retries).
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn budget(&self) -> &Arc<RetryBudget> {
        &self.budget
    }

    pub fn should_retry(
        &self,
        method: &Method,
        failure: &ForwardError,
        attempt: u32,
        cancelled: bool,
    ) -> bool {
        if cancelled {
            debug!("retry_skipped_client_cancelled");
            return false;
        }
        if attempt >= self.max_attempts {
            debug!(max_attempts = self.max_attempts, "retry_skipped_max_attempts");
            return false;
        }
        if !is_idempotent(method) {
            debug!(method = %method, "retry_skipped_non_idempotent");
            return false;
        }
        if !is_retryable(failure) {
            debug!(error = %failure, "retry_skipped_non_retryable");
            return false;
        }
        if !self.budget.try_consume() {
            debug!(
                available = self.budget.available(),
                "retry_skipped_budget_exhausted"
            );
            return false;
        }
        true
    }
}

/// Methods safe to replay against a different backend. POST and PATCH
/// are never retried; unknown methods are treated as unsafe.
pub fn is_idempotent(method: &Method) -> bool {
    matches!(
        *method,
        Method::GET | Method::HEAD | Method::OPTIONS | Method::PUT | Method::DELETE
    )
}

/// Failure classes that indicate the backend (not the request) is at
/// fault: transport-level connection errors, timeouts, and 5xx statuses.
pub fn is_retryable(failure: &ForwardError) -> bool {
    match failure {
        ForwardError::Connect(_) | ForwardError::Timeout => true,
        ForwardError::Status(status) => *status >= 500,
        ForwardError::Transport(message) => {
            let message = message.to_ascii_lowercase();
            [
                "connection refused",
                "connection reset",
                "broken pipe",
                "no route to host",
                "timed out",
                "deadline exceeded",
                "eof",
            ]
            .iter()
            .any(|needle| message.contains(needle))
        }
    }
}
