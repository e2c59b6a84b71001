use std::future::Future;
use std::time::Duration;

use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use tracing::{error, info};

use crate::error::{Result, VaultClientError};

/// Backoff parameters for retrying transient vault faults.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    pub fn no_retries() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }
}

/// Runs `op`, retrying on [`VaultClientError::is_retryable`] errors with
/// capped exponential backoff and jitter. Fatal errors (aborted jobs, bad
/// arguments) are returned immediately.
pub async fn retry_transient<T, F, Fut>(policy: RetryPolicy, api_tag: &'static str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let strategy = ExponentialBackoff::from_millis(policy.base_delay.as_millis().min(u64::MAX as u128) as u64)
        .max_delay(policy.max_delay)
        .map(jitter)
        .take(policy.max_attempts.saturating_sub(1));

    let mut attempt = 0usize;
    let result = RetryIf::spawn(
        strategy,
        || {
            attempt += 1;
            let try_idx = attempt;
            let fut = op();
            async move {
                let result = fut.await;
                if let Err(e) = &result {
                    if e.is_retryable() {
                        info!(api = api_tag, attempt = try_idx, "retryable vault error: {e}");
                    } else {
                        error!(api = api_tag, attempt = try_idx, "fatal vault error: {e}");
                    }
                }
                result
            }
        },
        |e: &VaultClientError| e.is_retryable(),
    )
    .await;

    if let Err(e) = &result {
        if e.is_retryable() {
            error!(api = api_tag, attempts = attempt, "no more retries; aborting: {e}");
        }
    }
    result
}
