//! Bounded retries with exponential backoff

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

use crate::core::config::CoordinatorConfig;

/// Result of running an operation under a [`RetryPolicy`]
#[derive(Debug)]
pub struct Attempted<T, E> {
    pub result: Result<T, E>,
    /// Number of times the operation was invoked
    pub attempts: u32,
}

/// Retry configuration for a single fallible operation
///
/// Attempt 1 runs immediately. Attempt `k >= 2` is preceded by a sleep of
/// `base_interval * 2^(k-2)`, capped at `max_interval`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_interval: Duration,
    max_interval: Option<Duration>,
    jitter: bool,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_interval: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_interval,
            max_interval: None,
            jitter: false,
        }
    }

    pub fn from_config(config: &CoordinatorConfig) -> Self {
        Self::new(config.max_retries, config.base_backoff)
            .with_max_interval(config.max_backoff)
            .with_jitter(config.backoff_jitter)
    }

    pub fn with_max_interval(mut self, max_interval: Duration) -> Self {
        self.max_interval = Some(max_interval);
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Sleep that precedes `attempt` (1-based); zero for the first attempt
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        // checked_shl only rejects shifts >= 32, so 2^31 still goes through
        // checked_mul and saturates there.
        let delay = 1u32
            .checked_shl(attempt - 2)
            .and_then(|factor| self.base_interval.checked_mul(factor))
            .unwrap_or(Duration::MAX);
        let delay = match self.max_interval {
            Some(max) => delay.min(max),
            None => delay,
        };
        if self.jitter {
            jittered(delay)
        } else {
            delay
        }
    }

    /// Run `op` until it succeeds or attempts run out; returns the last error
    pub async fn execute<F, Fut, T, E>(&self, op: F) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.execute_when(op, |_| true).await.result
    }

    /// Like [`execute`](Self::execute) but stops early when `should_retry` rejects an error
    pub async fn execute_when<F, Fut, T, E, P>(&self, mut op: F, should_retry: P) -> Attempted<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => {
                    return Attempted {
                        result: Ok(value),
                        attempts: attempt,
                    }
                }
                Err(e) => {
                    if attempt >= self.max_attempts || !should_retry(&e) {
                        return Attempted {
                            result: Err(e),
                            attempts: attempt,
                        };
                    }
                    attempt += 1;
                    let delay = self.delay_before(attempt);
                    debug!(attempt, delay_ms = delay.as_millis() as u64, "Retrying after failure");
                    if !delay.is_zero() {
                        sleep(delay).await;
                    }
                }
            }
        }
    }
}

fn jittered(delay: Duration) -> Duration {
    let factor = 1.0 + (fastrand::f64() * 0.2 - 0.1);
    Duration::try_from_secs_f64(delay.as_secs_f64() * factor).unwrap_or(delay)
}
