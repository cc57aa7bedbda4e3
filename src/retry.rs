//! Bounded exponential backoff shared by embedding calls and store writes.
//!
//! Delays double from `base_delay` on each retry and never exceed
//! `max_delay`: with the embedding defaults that is 1s, 2s, 4s, 8s, 16s, 32s.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay: Duration::from_secs(32),
        }
    }

    /// A policy that gives up after the first failure.
    pub fn none() -> Self {
        Self::new(0, Duration::ZERO)
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Why [`retry`] gave up.
#[derive(Debug)]
pub enum RetryError<E> {
    /// The error was not worth retrying.
    Fatal(E),
    /// Every attempt failed with a retryable error.
    Exhausted { attempts: u32, last: E },
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// policy runs out of retries.
pub async fn retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    what: &str,
    is_retryable: impl Fn(&E) -> bool,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0u32;
    loop {
        if attempt > 0 {
            tokio::time::sleep(policy.delay_for(attempt)).await;
        }
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if !is_retryable(&e) => return Err(RetryError::Fatal(e)),
            Err(e) if attempt >= policy.max_retries => {
                return Err(RetryError::Exhausted {
                    attempts: attempt + 1,
                    last: e,
                })
            }
            Err(e) => {
                attempt += 1;
                warn!(
                    what,
                    attempt,
                    max_retries = policy.max_retries,
                    error = %e,
                    "retrying after transient failure"
                );
            }
        }
    }
}
