//! Exponential backoff with jitter

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use super::error::TransportError;

/// Longest `Retry-After` the client will honor
const MAX_RETRY_AFTER: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_jitter_ms")]
    pub max_jitter_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_jitter_ms() -> u64 {
    500
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_jitter_ms: default_max_jitter_ms(),
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no waiting
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay_ms: 0,
            max_jitter_ms: 0,
        }
    }

    /// Deterministic part of the delay before retry number `attempt + 1`
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt);
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor))
    }

    /// Backoff plus random jitter in `0..=max_jitter_ms`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let jitter = if self.max_jitter_ms == 0 {
            0
        } else {
            rand::rng().random_range(0..=self.max_jitter_ms)
        };
        self.backoff(attempt) + Duration::from_millis(jitter)
    }
}

/// Run `operation` until it succeeds, fails terminally, or the retry
/// ceiling is reached
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    mut operation: F,
) -> Result<T, TransportError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, TransportError>>,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!("{} succeeded after {} retries", label, attempt);
                }
                return Ok(value);
            }
            Err(e) if e.should_retry() && attempt < policy.max_retries => {
                let mut delay = policy.delay_for(attempt);
                if let Some(requested) = e.retry_after() {
                    delay = delay.max(requested.min(MAX_RETRY_AFTER));
                }
                warn!(
                    "{} failed ({}), retry {}/{} in {:?}",
                    label,
                    e,
                    attempt + 1,
                    policy.max_retries,
                    delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
