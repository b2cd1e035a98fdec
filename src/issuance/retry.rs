use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use log::{debug, warn};

/// Bounded exponential backoff for calls to the DNS provider and the CA.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound on a single attempt.
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            attempt_timeout: Duration::from_secs(15),
        }
    }
}

impl RetryPolicy {
    /// Delay slept after the given failed attempt (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Errors that know whether another attempt could succeed.
pub trait Retryable: Display + Sized {
    fn is_transient(&self) -> bool;

    /// Error reported when an attempt exceeds its time budget.
    fn timed_out(operation: &str, after: Duration) -> Self;
}

/// Runs `attempt` until it succeeds, fails permanently, or the attempt
/// budget is spent. Every attempt is bounded by `policy.attempt_timeout`
/// and timeouts count as transient failures.
pub async fn with_backoff<T, E, F, Fut>(
    operation: &str,
    policy: &RetryPolicy,
    mut attempt: F,
) -> Result<T, E>
where
    E: Retryable,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut current = 1;
    loop {
        let err = match tokio::time::timeout(policy.attempt_timeout, attempt()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(err)) => err,
            Err(_) => E::timed_out(operation, policy.attempt_timeout),
        };

        if !err.is_transient() {
            debug!("[retry] {operation} failed permanently: {err}");
            return Err(err);
        }
        if current >= max_attempts {
            warn!("[retry] {operation} failed after {current} attempt(s): {err}");
            return Err(err);
        }

        let delay = policy.delay_after(current);
        debug!(
            "[retry] {operation} failed (attempt {current}/{max_attempts}), retrying in {}ms: {err}",
            delay.as_millis()
        );
        tokio::time::sleep(delay).await;
        current += 1;
    }
}
