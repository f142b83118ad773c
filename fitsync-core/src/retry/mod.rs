//! Retry helper shared by every retriable backend call
//!
//! Attempt `n` (1-based) that fails is followed by a pause of
//! `base_delay * 2^(n-1)`, capped at `max_delay`, unless it was the last one
//! or the error is not worth repeating.

use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::StoreConfig;

/// How many times to try, and how long to pause in between
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self { max_attempts: max_attempts.max(1), base_delay, max_delay: base_delay * 8 }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Pause after the given failed attempt (1-based)
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1u32 << exp).min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(500))
    }
}

impl From<&StoreConfig> for RetryPolicy {
    fn from(cfg: &StoreConfig) -> Self {
        Self::new(cfg.fetch_attempts, cfg.fetch_retry_delay)
    }
}

/// Run `op` until it succeeds, fails with an error `retriable` rejects, or the
/// policy is exhausted; returns the last error
pub async fn retry_if<T, E, F, Fut, P>(policy: RetryPolicy, what: &str, retriable: P, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(what, attempt, "Succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if attempt >= policy.max_attempts => {
                warn!(what, attempts = attempt, error = %e, "Giving up");
                return Err(e);
            }
            Err(e) if !retriable(&e) => {
                warn!(what, attempt, error = %e, "Permanent failure, not retrying");
                return Err(e);
            }
            Err(e) => {
                let pause = policy.delay_after(attempt);
                debug!(what, attempt, error = %e, pause = ?pause, "Attempt failed, retrying");
                tokio::time::sleep(pause).await;
                attempt += 1;
            }
        }
    }
}
