// Retry with exponential backoff and jitter for transient provider errors.
// Orthogonal to the circuit breaker: callers choose which one wraps the other.

use std::{fmt, future::Future, time::Duration};

use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
    // Uniform random jitter in [0, max_jitter_ms) added before capping
    pub max_jitter_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 1000,
            max_backoff_ms: 10000,
            backoff_multiplier: 2.0,
            max_jitter_ms: 1000,
        }
    }
}

impl RetryConfig {
    pub fn new(max_attempts: u32, initial_backoff_ms: u64, max_backoff_ms: u64) -> Self {
        Self {
            max_attempts,
            initial_backoff_ms,
            max_backoff_ms,
            ..Self::default()
        }
    }
}

// Delay before the attempt following `attempt` (1-based), capped at max_backoff_ms
pub fn calculate_backoff(attempt: u32, config: &RetryConfig) -> Duration {
    let exponent = attempt.saturating_sub(1) as f64;
    let base_backoff_ms = config.initial_backoff_ms as f64 * config.backoff_multiplier.powf(exponent);

    let jitter = if config.max_jitter_ms > 0 {
        rand::random::<f64>() * config.max_jitter_ms as f64
    } else {
        0.0
    };
    let backoff_ms = (base_backoff_ms + jitter).min(config.max_backoff_ms as f64);

    Duration::from_millis(backoff_ms as u64)
}

/// Runs `f` up to `max_attempts` times, sleeping with backoff between
/// attempts. Returns the last error once attempts are exhausted.
pub async fn retry_with_backoff<F, Fut, T, E>(config: &RetryConfig, f: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    retry_with_backoff_if(config, |_: &E| true, f).await
}

/// Like `retry_with_backoff`, but an error for which `should_retry` is false
/// is returned immediately.
pub async fn retry_with_backoff_if<F, Fut, T, E, P>(
    config: &RetryConfig,
    should_retry: P,
    mut f: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
    P: Fn(&E) -> bool,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if attempt >= max_attempts || !should_retry(&err) {
                    return Err(err);
                }

                let delay = calculate_backoff(attempt, config);
                tracing::debug!(
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Retry attempt failed, backing off"
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
    use std::sync::Arc;
    use tokio::time::Instant;

    #[test]
    fn test_backoff_grows_and_is_capped() {
        let config = RetryConfig {
            max_jitter_ms: 0,
            ..RetryConfig::default()
        };
        assert_eq!(calculate_backoff(1, &config), Duration::from_millis(1000));
        assert_eq!(calculate_backoff(2, &config), Duration::from_millis(2000));
        assert_eq!(calculate_backoff(3, &config), Duration::from_millis(4000));
        assert_eq!(calculate_backoff(8, &config), Duration::from_millis(10000));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let config = RetryConfig::default();
        for _ in 0..100 {
            let delay = calculate_backoff(1, &config);
            assert!(delay >= Duration::from_millis(1000));
            assert!(delay < Duration::from_millis(2000));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let started = Instant::now();

        let result: Result<&str, String> = retry_with_backoff(&RetryConfig::default(), || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err("503".to_string())
                } else {
                    Ok("ok")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 1s + 2s base delays, jitter on top
        assert!(started.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_returns_last_error_when_exhausted() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<(), String> = retry_with_backoff(&RetryConfig::new(3, 10, 100), || {
            let counter = counter.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                Err(format!("failure {n}"))
            }
        })
        .await;

        assert_eq!(result.unwrap_err(), "failure 3");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_error_stops_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<(), String> = retry_with_backoff_if(
            &RetryConfig::default(),
            |err: &String| err != "not found",
            || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err("not found".to_string())
                }
            },
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
