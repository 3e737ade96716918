use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use super::ProviderError;

/// Exponential backoff for transient provider failures.
///
/// Only errors where [`ProviderError::is_transient`] holds are retried; a
/// timeout or a 4xx is returned on the first occurrence.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    #[serde(with = "crate::config::millis")]
    pub initial_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_delay: Duration::from_secs(2),
            multiplier: 1.5,
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = self.multiplier.powi(retry.saturating_sub(1) as i32);
        self.initial_delay.mul_f64(factor)
    }
}

/// Run `call` until it succeeds, fails permanently, or retries run out.
///
/// The backoff sleep is abandoned as soon as `token` is cancelled.
pub async fn retry_with_backoff<F, Fut, T>(
    operation: &str,
    policy: &RetryPolicy,
    token: &CancellationToken,
    mut call: F,
) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let start = Instant::now();
    let mut retry = 0;

    loop {
        if token.is_cancelled() {
            return Err(ProviderError::Cancelled);
        }
        if retry > 0 {
            tracing::debug!(operation, attempt = retry + 1, "Retrying provider call");
        }

        match call().await {
            Ok(value) => {
                if retry > 0 {
                    tracing::debug!(
                        operation,
                        attempt = retry + 1,
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        "Provider call succeeded after retry"
                    );
                }
                return Ok(value);
            }
            Err(err) if !err.is_transient() => return Err(err),
            Err(err) if retry >= policy.max_retries => {
                tracing::error!(
                    operation,
                    attempts = retry + 1,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Provider call failed after exhausting retries: {}",
                    err
                );
                return Err(err);
            }
            Err(err) => {
                retry += 1;
                let delay = policy.delay_for(retry);
                tracing::warn!(
                    operation,
                    retry,
                    delay_ms = delay.as_millis() as u64,
                    "Transient provider failure, backing off: {}",
                    err
                );
                tokio::select! {
                    _ = token.cancelled() => return Err(ProviderError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}
