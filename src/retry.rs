//! Retry with exponential backoff, stoppable through a [`CancellationToken`].
use std::{future::Future, time::Duration};

use tokio_util::sync::CancellationToken;

use crate::{Error, Result};

/// Retry policy used while initializing a client.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Number of retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Each retry waits `backoff_factor` times longer than the previous one.
    pub backoff_factor: u32,
}

impl RetryPolicy {
    pub const DEFAULT_MAX_RETRIES: u32 = 5;
    pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_secs(1);
    pub const DEFAULT_BACKOFF_FACTOR: u32 = 2;

    pub fn new() -> RetryPolicy {
        RetryPolicy::default()
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> RetryPolicy {
        self.max_retries = max_retries;
        self
    }

    pub fn with_initial_delay(mut self, initial_delay: Duration) -> RetryPolicy {
        self.initial_delay = initial_delay;
        self
    }

    /// Delay to wait after `attempt` (zero-based) failed.
    pub fn delay(&self, attempt: u32) -> Duration {
        backoff_delay(self.initial_delay, self.backoff_factor, attempt, Duration::MAX)
    }
}

impl Default for RetryPolicy {
    fn default() -> RetryPolicy {
        RetryPolicy {
            max_retries: RetryPolicy::DEFAULT_MAX_RETRIES,
            initial_delay: RetryPolicy::DEFAULT_INITIAL_DELAY,
            backoff_factor: RetryPolicy::DEFAULT_BACKOFF_FACTOR,
        }
    }
}

/// `initial * factor^attempt`, saturating and capped at `max`.
pub(crate) fn backoff_delay(initial: Duration, factor: u32, attempt: u32, max: Duration) -> Duration {
    let multiplier = factor.saturating_pow(attempt);
    initial.saturating_mul(multiplier).min(max)
}

/// Run `operation` until it succeeds, retrying according to `policy`.
///
/// Returns the last error once retries are exhausted, or [`Error::Closed`] as soon as
/// `cancellation` is cancelled. Cancellation is checked before every attempt and interrupts the
/// backoff wait.
pub async fn retry<T, F, Fut>(
    policy: &RetryPolicy,
    cancellation: &CancellationToken,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        if cancellation.is_cancelled() {
            return Err(Error::Closed);
        }

        let err = match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if attempt >= policy.max_retries {
            return Err(err);
        }

        let delay = policy.delay(attempt);
        log::debug!(target: "featureboard", attempt, delay_ms = delay.as_millis() as u64; "retrying after error: {err}");
        attempt += 1;

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancellation.cancelled() => return Err(Error::Closed),
        }
    }
}
