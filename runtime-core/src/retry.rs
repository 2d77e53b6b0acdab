// runtime-core/src/retry.rs

//! Backoff policy for polling loops.
//!
//! Blocking polls on the transport retry under an exponential backoff while no
//! matching message is available. Any other outcome ends the loop: errors are
//! never retried at this layer.

use std::time::Duration;

use crate::config::TransportConfig;

/// Backoff policy of a polling loop. Attempts are unbounded; only the delay
/// is capped.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl From<&TransportConfig> for RetryConfig {
    fn from(transport: &TransportConfig) -> Self {
        Self::new(
            Duration::from_millis(transport.poll_initial_backoff_ms),
            Duration::from_millis(transport.poll_max_backoff_ms),
        )
    }
}

impl RetryConfig {
    /// Doubles the delay from `initial_delay` up to `max_delay`.
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
            backoff_multiplier: 2.0,
        }
    }

    /// Delay before retry number `attempt` (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        // Exponent is clamped; the delay saturates at max_delay long before.
        let base = self.initial_delay.as_secs_f64()
            * self.backoff_multiplier.powi(attempt.min(64) as i32);
        Duration::from_secs_f64(base.min(self.max_delay.as_secs_f64()))
    }
}

/// Outcome of one attempt.
#[derive(Debug)]
pub enum RetryResult<T, E> {
    Ok(T),
    /// Nothing yet; try again after the backoff.
    Retry,
    Fail(E),
}

/// Run `operation` until it succeeds or fails for good.
pub async fn retry_async<T, E, F, Fut>(config: &RetryConfig, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = RetryResult<T, E>>,
{
    let mut attempt = 0u32;
    loop {
        match operation().await {
            RetryResult::Ok(value) => return Ok(value),
            RetryResult::Fail(error) => return Err(error),
            RetryResult::Retry => {
                tokio::time::sleep(config.delay_for_attempt(attempt)).await;
                attempt = attempt.saturating_add(1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[test]
    fn test_delay_for_attempt() {
        let config = RetryConfig::new(Duration::from_millis(100), Duration::from_secs(30));

        assert_eq!(config.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(400));
        assert_eq!(config.delay_for_attempt(3), Duration::from_millis(800));
    }

    #[test]
    fn test_delay_saturates_at_max_delay() {
        let config = RetryConfig::new(Duration::from_millis(1), Duration::from_millis(50));
        assert_eq!(config.delay_for_attempt(3), Duration::from_millis(8));
        assert_eq!(config.delay_for_attempt(10), Duration::from_millis(50));
        assert_eq!(config.delay_for_attempt(u32::MAX), Duration::from_millis(50));
    }

    #[test]
    fn test_from_transport_config() {
        let transport = TransportConfig {
            poll_initial_backoff_ms: 2,
            poll_max_backoff_ms: 40,
            ..Default::default()
        };

        let retry = RetryConfig::from(&transport);
        assert_eq!(retry.initial_delay, Duration::from_millis(2));
        assert_eq!(retry.max_delay, Duration::from_millis(40));
    }

    #[tokio::test]
    async fn test_retry_async_eventual_success() {
        let config = RetryConfig::new(Duration::from_millis(1), Duration::from_millis(2));

        let attempts = AtomicU32::new(0);
        let result = retry_async(&config, || {
            let count = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if count < 4 {
                    RetryResult::<i32, &str>::Retry
                } else {
                    RetryResult::Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(42));
        assert_eq!(attempts.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_retry_async_fail_is_not_retried() {
        let config = RetryConfig::new(Duration::from_millis(1), Duration::from_millis(2));

        let attempts = AtomicU32::new(0);
        let result = retry_async(&config, || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { RetryResult::Fail::<i32, _>("fatal") }
        })
        .await;

        assert_eq!(result, Err("fatal"));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
