//! Exponential backoff with jitter for upstream calls.
//!
//! Only errors whose [`SyncError::is_retryable`] is true are retried. Rate
//! limits wait for the longer of `Retry-After` and a multiplied backoff, never
//! longer than `max_retry_after`.

use rand::Rng;
use retail_halo::config::RetryConfig;
use retail_halo::credentials::UpstreamApi;
use retail_halo::SyncError;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Retry limits shared by every upstream call in a run.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub rate_limit_multiplier: u32,
    pub max_retry_after: Duration,
}

impl RetryPolicy {
    /// Single attempt, no waiting.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            rate_limit_multiplier: 1,
            max_retry_after: Duration::ZERO,
        }
    }

    /// Backoff before retry number `attempt` (0-based), before jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Delay to wait after `error` on attempt `attempt`.
    pub fn delay_for(&self, error: &SyncError, attempt: u32) -> Duration {
        let backoff = jitter(self.backoff(attempt));
        match error {
            SyncError::RateLimit { retry_after, .. } => {
                let stretched = backoff.saturating_mul(self.rate_limit_multiplier);
                let wait = retry_after.map_or(stretched, |after| after.max(stretched));
                wait.min(self.max_retry_after.max(stretched))
            }
            _ => backoff,
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            rate_limit_multiplier: config.rate_limit_multiplier.max(1),
            max_retry_after: Duration::from_millis(config.max_retry_after_ms),
        }
    }
}

/// Uniform in `[delay / 2, delay]`.
fn jitter(delay: Duration) -> Duration {
    if delay.is_zero() {
        return delay;
    }
    let millis = delay.as_millis() as u64;
    Duration::from_millis(rand::thread_rng().gen_range(millis / 2..=millis))
}

/// Runs `op` until it succeeds, fails with a non-retryable error, or the
/// policy's attempts are used up. `op` receives the 0-based attempt number.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    api: UpstreamApi,
    op_name: &str,
    mut op: F,
) -> Result<T, SyncError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, SyncError>>,
{
    let mut attempt = 0;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt + 1 < policy.max_attempts => {
                let delay = policy.delay_for(&e, attempt);
                warn!(
                    api = %api,
                    op = op_name,
                    attempt = attempt + 1,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Upstream call failed, will retry"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                debug!(
                    api = %api,
                    op = op_name,
                    attempts = attempt + 1,
                    error = %e,
                    "Upstream call failed, giving up"
                );
                return Err(e);
            }
        }
    }
}
