//! Bounded retry with exponential backoff for GitHub requests.

use crate::error::ApiError;
use std::future::Future;
use std::time::Duration;

/// Cap on the backoff exponent (32x the base delay).
const MAX_BACKOFF_SHIFT: u32 = 5;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per request, including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// Upper bound on the exponential part. A server-provided rate-limit
    /// reset is honored even when it is longer.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt following failed attempt number `attempt` (0-based).
    ///
    /// Uses `base_delay * 2^attempt`, capped at `max_delay`, and never less
    /// than the error's own `retry_after`.
    pub fn delay_for(&self, attempt: u32, error: &ApiError) -> Duration {
        let backoff = self
            .base_delay
            .saturating_mul(1 << attempt.min(MAX_BACKOFF_SHIFT))
            .min(self.max_delay);

        match error.retry_after() {
            Some(retry_after) => backoff.max(retry_after),
            None => backoff,
        }
    }

    /// Runs `operation` until it succeeds, fails fatally, or the attempt budget runs out.
    pub async fn run<T, F, Fut>(&self, route: &str, mut operation: F) -> Result<T, ApiError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        let mut attempt = 0;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() => {
                    attempt += 1;
                    if attempt >= self.max_attempts {
                        tracing::error!(route, attempts = attempt, "Giving up: {}", err);
                        return Err(ApiError::RetriesExhausted {
                            attempts: attempt,
                            last: Box::new(err),
                        });
                    }

                    let delay = self.delay_for(attempt - 1, &err);
                    tracing::warn!(
                        route,
                        attempt,
                        delay_secs = delay.as_secs_f64(),
                        "Retrying after {}",
                        err
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
