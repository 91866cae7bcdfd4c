//! Bounded-retry readiness polling for externally-started services.

use std::time::Duration;

use crate::errors::{Result, WebtestflowError};

/// Retry budget for a readiness poll.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retries after the initial attempt.
    pub retry_limit: u32,
    /// Delay between attempts.
    pub interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retry_limit: 10,
            interval: Duration::from_millis(1000),
        }
    }
}

impl RetryPolicy {
    /// Creates a policy with an explicit retry count and interval.
    #[must_use]
    pub fn new(retry_limit: u32, interval: Duration) -> Self {
        Self {
            retry_limit,
            interval,
        }
    }

    /// A single-attempt policy, used when probing for an already-running
    /// instance that either answers now or is considered gone.
    #[must_use]
    pub fn once() -> Self {
        Self {
            retry_limit: 0,
            interval: Duration::from_millis(0),
        }
    }
}

/// Polls `url` until it answers with a success status or the retry budget
/// is exhausted.
///
/// # Errors
///
/// Returns [`WebtestflowError::ReadinessTimeout`] after the final failed
/// attempt.
pub async fn wait_until_available(url: &str, policy: &RetryPolicy) -> Result<()> {
    let mut attempts = 0u32;

    loop {
        attempts += 1;

        let ready = match reqwest::get(url).await {
            Ok(response) => response.status().is_success(),
            Err(err) => {
                tracing::debug!(url, error = %err, "readiness probe failed");
                false
            }
        };

        if ready {
            tracing::info!(url, attempts, "readiness check passed");
            return Ok(());
        }

        if attempts > policy.retry_limit {
            return Err(WebtestflowError::ReadinessTimeout {
                url: url.to_string(),
                attempts,
            });
        }

        tracing::info!(
            url,
            attempt = attempts,
            retry_limit = policy.retry_limit,
            wait_ms = policy.interval.as_millis() as u64,
            "not reachable yet, retrying"
        );
        tokio::time::sleep(policy.interval).await;
    }
}
