//! Retry advice with configurable backoff and jitter strategies.
//!
//! The policy here only advises: it computes bounded delay sequences for
//! retryable faults and preserves the full history of attempted delays.
//! Whole-stage retry is strictly the orchestrator's responsibility; the
//! helpers in this module are for sub-operations inside one invocation
//! (e.g. blob store writes).

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::errors::{Result, VeristateError};

/// Backoff strategy for retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BackoffStrategy {
    /// delay = base * 2^attempt
    #[default]
    Exponential,
    /// delay = base * (attempt + 1)
    Linear,
    /// delay = base (constant)
    Constant,
}

/// Jitter strategy to prevent thundering herd.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum JitterStrategy {
    /// No jitter
    #[default]
    None,
    /// Random from 0 to delay
    Full,
    /// Half fixed, half random
    Equal,
}

/// Bounded retry policy for sub-operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum attempts, including the initial one.
    pub max_attempts: usize,
    /// Base delay between attempts in milliseconds.
    pub base_delay_ms: u64,
    /// Delay cap in milliseconds.
    pub max_delay_ms: u64,
    /// Backoff strategy.
    pub backoff: BackoffStrategy,
    /// Jitter strategy.
    pub jitter: JitterStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 30_000,
            backoff: BackoffStrategy::Exponential,
            jitter: JitterStrategy::None,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum attempts.
    #[must_use]
    pub const fn with_max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Sets the base delay.
    #[must_use]
    pub const fn with_base_delay_ms(mut self, delay: u64) -> Self {
        self.base_delay_ms = delay;
        self
    }

    /// Sets the delay cap.
    #[must_use]
    pub const fn with_max_delay_ms(mut self, delay: u64) -> Self {
        self.max_delay_ms = delay;
        self
    }

    /// Sets the backoff strategy.
    #[must_use]
    pub const fn with_backoff(mut self, strategy: BackoffStrategy) -> Self {
        self.backoff = strategy;
        self
    }

    /// Sets the jitter strategy.
    #[must_use]
    pub const fn with_jitter(mut self, strategy: JitterStrategy) -> Self {
        self.jitter = strategy;
        self
    }
}

/// Attempt tracking with a preserved delay history.
#[derive(Debug, Default)]
pub struct RetryState {
    /// Current attempt number (0-indexed).
    pub attempt: usize,
    /// Every delay handed out so far, in order.
    delays: Vec<Duration>,
}

impl RetryState {
    /// Creates a fresh state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The delays attempted so far, in order.
    #[must_use]
    pub fn delays(&self) -> &[Duration] {
        &self.delays
    }

    /// Returns true if no attempts remain under `policy`.
    #[must_use]
    pub fn is_exhausted(&self, policy: &RetryPolicy) -> bool {
        // attempt counts the initial try, so max_attempts - 1 retries remain
        self.attempt + 1 >= policy.max_attempts
    }

    /// Computes the delay for the current attempt and records it.
    #[must_use]
    pub fn next_delay(&mut self, policy: &RetryPolicy) -> Duration {
        let base = policy.base_delay_ms;
        let max = policy.max_delay_ms;
        let attempt = u32::try_from(self.attempt).unwrap_or(u32::MAX);

        let raw = match policy.backoff {
            BackoffStrategy::Exponential => {
                base.saturating_mul(2u64.saturating_pow(attempt)).min(max)
            }
            BackoffStrategy::Linear => base
                .saturating_mul(u64::from(attempt).saturating_add(1))
                .min(max),
            BackoffStrategy::Constant => base.min(max),
        };

        let jittered = match policy.jitter {
            JitterStrategy::None => raw,
            JitterStrategy::Full => {
                if raw == 0 {
                    0
                } else {
                    rand::thread_rng().gen_range(0..=raw)
                }
            }
            JitterStrategy::Equal => {
                let half = raw / 2;
                if half == 0 {
                    raw
                } else {
                    half + rand::thread_rng().gen_range(0..=half)
                }
            }
        };

        let delay = Duration::from_millis(jittered);
        self.delays.push(delay);
        self.attempt += 1;
        delay
    }
}

/// Executes `operation` with bounded retries for retryable faults.
///
/// Non-retryable faults are returned immediately. When attempts are
/// exhausted, the final error carries every delay that was attempted.
///
/// # Errors
///
/// Returns the last classified error once retries are exhausted or the
/// fault is not retryable.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut state = RetryState::new();

    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(mut err) => {
                if !err.is_retryable() || state.is_exhausted(policy) {
                    for delay in state.delays() {
                        err.record_delay(*delay);
                    }
                    return Err(err);
                }

                let delay = state.next_delay(policy);
                tracing::debug!(
                    attempt = state.attempt,
                    delay_ms = delay.as_millis() as u64,
                    code = err.code(),
                    error = %err,
                    "retrying after retryable fault"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Runs `operation` under a caller-supplied deadline.
///
/// On expiry the result is a retryable transient timeout rather than a
/// half-registered write: the operation's side effects may exist in the
/// store but nothing was recorded in the envelope.
///
/// # Errors
///
/// Returns the operation's own error, or a transient timeout on expiry.
pub async fn with_deadline<T, Fut>(
    operation_name: &str,
    budget: Duration,
    operation: Fut,
) -> Result<T>
where
    Fut: std::future::Future<Output = Result<T>>,
{
    match tokio::time::timeout(budget, operation).await {
        Ok(result) => result,
        Err(_) => Err(VeristateError::timeout(operation_name, budget)),
    }
}
