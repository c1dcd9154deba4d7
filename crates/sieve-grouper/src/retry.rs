use std::future::Future;
use std::time::Duration;

use sieve_store::StoreResult;
use tracing::warn;

use crate::config::RetryConfig;

/// Exponential backoff: `initial` doubled per prior failure, capped at `max`.
pub fn compute_retry_delay(failure_count: u32, initial: Duration, max: Duration) -> Duration {
    let mut delay = initial;
    for _ in 1..failure_count {
        delay = delay.saturating_mul(2);
        if delay >= max {
            return max;
        }
    }
    std::cmp::min(delay, max)
}

/// Runs `operation`, retrying transient store errors up to
/// `retry.max_attempts` total attempts. Other errors return immediately.
pub async fn with_retry<T, F, Fut>(
    retry: &RetryConfig,
    operation: &'static str,
    mut attempt: F,
) -> StoreResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StoreResult<T>>,
{
    let mut failure_count = 0u32;
    loop {
        match attempt().await {
            Ok(value) => return Ok(value),
            Err(error) if error.is_transient() && failure_count + 1 < retry.max_attempts => {
                failure_count += 1;
                let delay = compute_retry_delay(
                    failure_count,
                    retry.initial_backoff(),
                    retry.max_backoff(),
                );
                warn!(
                    operation,
                    failure_count,
                    delay_ms = delay.as_millis() as u64,
                    %error,
                    "transient store error; retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(error) => return Err(error),
        }
    }
}
