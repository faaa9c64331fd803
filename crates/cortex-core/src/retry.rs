use cortex_common::config::RetryConfig;
use cortex_common::Result;
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Exponential backoff with jitter for retryable (transport) failures.
/// Non-retryable errors propagate immediately.
pub async fn with_backoff<T, F, Fut>(config: &RetryConfig, op_name: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt: u32 = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < config.max_retries => {
                let delay = backoff_delay(config, attempt);
                tracing::warn!(
                    "{op_name} failed (attempt {}/{}), retrying in {:?}: {err}",
                    attempt + 1,
                    config.max_retries,
                    delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

fn backoff_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let exp = config
        .base_delay_ms
        .saturating_mul(1u64 << attempt.min(16))
        .min(config.max_delay_ms);
    let jitter = rand::thread_rng().gen_range(0..=exp / 2);
    Duration::from_millis(exp.saturating_add(jitter).min(config.max_delay_ms))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cortex_common::CortexError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_config() -> RetryConfig {
        RetryConfig {
            max_retries: 3,
            base_delay_ms: 1,
            max_delay_ms: 4,
        }
    }

    #[tokio::test]
    async fn test_retries_transport_until_success() -> anyhow::Result<()> {
        let attempts = AtomicU32::new(0);
        let value = with_backoff(&fast_config(), "test", || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(CortexError::transport("flaky"))
                } else {
                    Ok(42)
                }
            }
        })
        .await?;
        assert_eq!(value, 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        Ok(())
    }

    #[tokio::test]
    async fn test_validation_not_retried() {
        let attempts = AtomicU32::new(0);
        let result: Result<()> = with_backoff(&fast_config(), "test", || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(CortexError::validation("bad input")) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let attempts = AtomicU32::new(0);
        let result: Result<()> = with_backoff(&fast_config(), "test", || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(CortexError::transport("down")) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_delay_capped() {
        let config = RetryConfig {
            max_retries: 10,
            base_delay_ms: 100,
            max_delay_ms: 500,
        };
        for attempt in 0..10 {
            assert!(backoff_delay(&config, attempt) <= Duration::from_millis(500));
        }
    }
}
