//! Retry policy for object-store requests.
//!
//! Only transient failures (timeouts, resets, 5xx) earn another attempt;
//! everything else either has its own recovery path or will fail the same
//! way again. The delay before each retry doubles from `base_delay` up to
//! `max_delay`.

use std::time::Duration;

use tracing::{debug, warn};

use crate::error::PipelineError;

/// Largest exponent fed into the doubling schedule; past this the cap has
/// long since taken over and shifting any further would overflow.
const MAX_DOUBLINGS: u32 = 16;

/// Backoff policy for one class of requests.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total tries allowed, including the first. Zero is rejected at run
    /// time rather than silently meaning "never try".
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Ceiling on the doubling schedule.
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryConfig {
    /// Drive an async operation under this policy.
    ///
    /// Returns the first success, the first non-retryable error, or the
    /// final transient error once the attempt budget is spent.
    pub async fn run<T, F, Fut>(&self, operation: F) -> Result<T, PipelineError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, PipelineError>>,
    {
        if self.max_attempts == 0 {
            return Err(PipelineError::config("retry policy allows zero attempts"));
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            let error = match operation().await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            if !error.is_retryable() {
                debug!("not retrying: {}", error);
                return Err(error);
            }
            if attempt == self.max_attempts {
                warn!("giving up after {} attempts: {}", attempt, error);
                return Err(error);
            }

            let delay = self.delay_before(attempt);
            debug!(
                "attempt {} of {} failed ({}); next try in {:?}",
                attempt, self.max_attempts, error, delay
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Delay after the given number of failures: `base_delay` doubled per
    /// failure beyond the first, capped at `max_delay`.
    fn delay_before(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(MAX_DOUBLINGS);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn quick(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        }
    }

    fn counter() -> Arc<AtomicU32> {
        Arc::new(AtomicU32::new(0))
    }

    #[tokio::test]
    async fn test_zero_attempts_is_an_error() {
        let calls = counter();
        let result = quick(0)
            .run(|| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<u32, PipelineError>(1)
                }
            })
            .await;

        assert!(matches!(result, Err(PipelineError::Config(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_first_try_success_skips_backoff() {
        let calls = counter();
        let result = quick(5)
            .run(|| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<&str, PipelineError>("tile")
                }
            })
            .await;

        assert_eq!(result.unwrap(), "tile");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_recovers_once_the_blip_clears() {
        let calls = counter();
        let result = quick(4)
            .run(|| {
                let calls = calls.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(PipelineError::transient("socket reset"))
                    } else {
                        Ok(9)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 9);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_transient_errors_spend_the_whole_budget() {
        let calls = counter();
        let result = quick(3)
            .run(|| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<u32, _>(PipelineError::transient("still down"))
                }
            })
            .await;

        assert!(matches!(result, Err(PipelineError::Transient(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_stops_on_the_spot() {
        let calls = counter();
        let result = quick(5)
            .run(|| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<u32, _>(PipelineError::upload("403 forbidden"))
                }
            })
            .await;

        assert!(matches!(result, Err(PipelineError::Upload(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_delay_doubles_then_caps() {
        let config = RetryConfig {
            max_attempts: 5,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(7),
        };

        assert_eq!(config.delay_before(1), Duration::from_secs(2));
        assert_eq!(config.delay_before(2), Duration::from_secs(4));
        assert_eq!(config.delay_before(3), Duration::from_secs(7));
        // Deep into the schedule the shift saturates instead of overflowing.
        assert_eq!(config.delay_before(500), Duration::from_secs(7));
    }

    #[test]
    fn test_default_budget_is_five_attempts() {
        assert_eq!(RetryConfig::default().max_attempts, 5);
    }
}
