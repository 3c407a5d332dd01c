//! In-call retry orchestration for provider attempts.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::result::ProviderError;

/// Retry schedule applied inside a single `analyze` call.
///
/// Delay before retry `n` (1-indexed) is `base_delay × factor^(n−1)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetrySchedule {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub factor: f64,
}

impl Default for RetrySchedule {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(200),
            factor: 2.5,
        }
    }
}

impl RetrySchedule {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    pub fn delay_before_retry(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let exp = self.factor.powi(retry as i32 - 1);
        Duration::from_nanos((self.base_delay.as_nanos() as f64 * exp).round() as u64)
    }

    /// Run `attempt` until it succeeds, fails non-retryably, or retries are
    /// exhausted. The closure receives the 0-indexed attempt number.
    pub async fn run<T, F, Fut>(&self, mut attempt: F) -> Result<T, ProviderError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut retry = 0;
        loop {
            match attempt(retry).await {
                Ok(value) => return Ok(value),
                Err(err) if err.retryable() && retry < self.max_retries => {
                    retry += 1;
                    let delay = self.delay_before_retry(retry);
                    warn!(
                        code = %err.code,
                        retry,
                        delay_ms = delay.as_millis() as u64,
                        error = %err.message,
                        "provider attempt failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
