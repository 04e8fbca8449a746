//! Retry policy with full-jitter exponential backoff, layered in front of
//! (not instead of) the circuit breaker: a call first checks the breaker,
//! then retries on transient failure within the breaker's own before/record
//! bookkeeping.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub max_attempts: u8,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub exponential_base: f64,
}

impl RetryConfig {
    pub fn default_config() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs_f64(1.0),
            max_delay: Duration::from_secs_f64(30.0),
            exponential_base: 2.0,
        }
    }

    pub fn database_config() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs_f64(0.5),
            max_delay: Duration::from_secs_f64(10.0),
            exponential_base: 2.0,
        }
    }

    pub fn external_service_config() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs_f64(2.0),
            max_delay: Duration::from_secs_f64(60.0),
            exponential_base: 2.5,
        }
    }

    /// Full-jitter exponential backoff: delay is a uniform random draw in
    /// `[0, base * exponential_base^attempt]`, capped at `max_delay`.
    fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.as_secs_f64() * self.exponential_base.powi(attempt as i32);
        let capped = exp.min(self.max_delay.as_secs_f64());
        let jittered = rand::thread_rng().gen_range(0.0..=capped.max(0.0));
        Duration::from_secs_f64(jittered)
    }
}

/// Runs `op` up to `config.max_attempts` times, sleeping a full-jitter
/// backoff between attempts. `is_retryable` decides whether a given error
/// should trigger another attempt; errors it rejects are returned
/// immediately without further attempts.
pub async fn retry_with_backoff<T, E, F, Fut, R>(
    config: RetryConfig,
    operation_name: &str,
    is_retryable: R,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
{
    let mut attempt: u32 = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                let attempts_made = attempt + 1;
                if attempts_made >= config.max_attempts as u32 || !is_retryable(&err) {
                    return Err(err);
                }
                let delay = config.backoff_for_attempt(attempt);
                warn!(
                    operation = operation_name,
                    attempt = attempts_made,
                    delay_ms = delay.as_millis() as u64,
                    "retrying after transient failure"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn backoff_never_exceeds_max_delay() {
        let config = RetryConfig {
            max_attempts: 10,
            base_delay: Duration::from_secs_f64(1.0),
            max_delay: Duration::from_secs_f64(5.0),
            exponential_base: 2.0,
        };
        for attempt in 0..10 {
            let delay = config.backoff_for_attempt(attempt);
            assert!(delay.as_secs_f64() <= 5.0);
        }
    }

    #[tokio::test]
    async fn retries_until_success_within_max_attempts() {
        let calls = AtomicU32::new(0);
        let config = RetryConfig {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            exponential_base: 2.0,
        };

        let result: Result<&str, &str> = retry_with_backoff(
            config,
            "test_op",
            |_: &&str| true,
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err("transient")
                    } else {
                        Ok("ok")
                    }
                }
            },
        )
        .await;

        assert_eq!(result, Ok("ok"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let config = RetryConfig {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            exponential_base: 2.0,
        };

        let result: Result<&str, &str> = retry_with_backoff(config, "test_op", |_: &&str| true, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err("always fails") }
        })
        .await;

        assert_eq!(result, Err("always fails"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn non_retryable_error_stops_immediately() {
        let calls = AtomicU32::new(0);
        let config = RetryConfig::default_config();

        let result: Result<&str, &str> =
            retry_with_backoff(config, "test_op", |_: &&str| false, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("permanent") }
            })
            .await;

        assert_eq!(result, Err("permanent"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
