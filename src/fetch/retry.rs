use std::future::Future;
use std::time::Duration;

use tracing::debug;

use crate::error::Result;

/// Exponential backoff: attempt 0 runs immediately; failed attempt `k`
/// sleeps `base_delay * 2^k` before attempt `k + 1`, up to `max_retries`
/// total attempts.
#[derive(Clone, Copy, Debug)]
pub struct BackoffPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl BackoffPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt)
    }
}

/// Runs `operation` under the policy. Non-retriable errors (configuration,
/// quota) short-circuit without sleeping; the last error is returned once
/// attempts are exhausted.
pub async fn with_backoff<F, Fut, T>(policy: BackoffPolicy, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if !err.is_retriable() => return Err(err),
            Err(err) => {
                if attempt + 1 >= policy.max_retries {
                    return Err(err);
                }
                let delay = policy.delay_for(attempt);
                debug!(
                    attempt,
                    delay_secs = delay.as_secs(),
                    error = %err,
                    "upstream attempt failed; backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
