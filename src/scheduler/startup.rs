//! App-start initialization retry
//!
//! Store outages at startup are retried with exponential backoff for a
//! bounded number of attempts. This is separate from per-task failure
//! handling, which never retries.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::config::SchedulerConfig;
use crate::error::Result;

/// Bounded retry policy for scheduler initialization
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InitRetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
}

impl Default for InitRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_backoff_ms: 1000,
            max_backoff_ms: 60_000,
            multiplier: 2.0,
        }
    }
}

impl From<&SchedulerConfig> for InitRetryPolicy {
    fn from(c: &SchedulerConfig) -> Self {
        Self {
            max_attempts: c.init_max_attempts.max(1),
            initial_backoff_ms: c.init_initial_backoff_ms,
            max_backoff_ms: c.init_max_backoff_ms,
            ..Default::default()
        }
    }
}

/// Run `op` until it succeeds or the policy's attempts are exhausted
///
/// Returns the last error when every attempt failed.
pub async fn with_retry<T, F, Fut>(policy: &InitRetryPolicy, mut op: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= policy.max_attempts => return Err(e),
            Err(e) => {
                let delay = calculate_backoff(
                    attempt,
                    policy.initial_backoff_ms,
                    policy.max_backoff_ms,
                    policy.multiplier,
                );
                warn!(
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay,
                    error = %e,
                    "Task scheduler initialization failed, retrying"
                );
                tokio::time::sleep(Duration::from_millis(delay)).await;
                attempt += 1;
            }
        }
    }
}

/// Calculate exponential backoff with jitter
pub fn calculate_backoff(attempt: u32, initial_ms: u64, max_ms: u64, multiplier: f64) -> u64 {
    let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
    let base_delay = initial_ms as f64 * multiplier.powi(exponent);
    let capped = base_delay.min(max_ms as f64);

    // Add jitter (+/-25%)
    let jitter = capped * 0.25 * (rand_simple() * 2.0 - 1.0);
    ((capped + jitter) as u64).clamp(initial_ms.min(max_ms), max_ms.max(initial_ms))
}

/// Simple pseudo-random for jitter
fn rand_simple() -> f64 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or_default();
    (nanos as f64) / (u32::MAX as f64)
}
