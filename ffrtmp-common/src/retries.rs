use crate::config::RetryConfig;
use std::fmt::Display;
use std::future::Future;
use tracing::{info, warn};

/// Runs `action` until it succeeds, fails permanently, or the retry
/// policy is exhausted. This is a transport-level helper; callers must
/// not wrap operations that are unsafe to repeat.
pub async fn with_retries<T, E, F, Fut>(
    description: &str,
    config: &RetryConfig,
    is_retryable: impl Fn(&E) -> bool,
    mut action: F,
) -> Result<T, E>
where
    E: Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match action().await {
            Ok(value) => {
                if attempt > 1 {
                    info!("{description} succeeded after {attempt} attempts");
                }
                return Ok(value);
            }
            Err(error) if !is_retryable(&error) => {
                warn!("{description} failed permanently: {error}");
                return Err(error);
            }
            Err(error) => match config.delay_for_attempt(attempt) {
                Some(delay) => {
                    warn!(
                        "{description} failed (attempt {attempt}/{}): {error}; retrying in {delay:?}",
                        config.max_attempts
                    );
                    tokio::time::sleep(delay).await;
                }
                None => {
                    warn!(
                        "{description} failed after {attempt} attempts, giving up: {error}"
                    );
                    return Err(error);
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn quick_config(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            min_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            multiplier: 2.0,
        }
    }

    #[test]
    async fn succeeds_without_retry() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> = with_retries("op", &quick_config(3), |_| true, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(42) }
        })
        .await;
        assert_eq!(result, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    async fn retries_until_success() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> = with_retries("op", &quick_config(5), |_| true, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err("transient".to_string())
                } else {
                    Ok(7)
                }
            }
        })
        .await;
        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    async fn gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> = with_retries("op", &quick_config(3), |_| true, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err("down".to_string()) }
        })
        .await;
        assert_eq!(result, Err("down".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    async fn permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> = with_retries(
            "op",
            &quick_config(5),
            |error: &String| error == "transient",
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("permanent".to_string()) }
            },
        )
        .await;
        assert_eq!(result, Err("permanent".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
