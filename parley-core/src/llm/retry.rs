//! Retry executor for completion calls
//!
//! Wraps a single remote attempt with classification-driven exponential
//! backoff. Only [`FailureClass::RateLimited`] and
//! [`FailureClass::TransientConnection`] are retried; everything else is
//! handed straight back to the caller. Context overflow in particular is
//! recovered by the session orchestrator, never here.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::failure::{CompletionError, FailureClass};
use crate::error::ParleyError;

/// Retry policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first one
    pub max_attempts: usize,
    /// Delay before the first retry
    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    /// Multiplier applied to the delay after every retry
    pub backoff_multiplier: f64,
    /// Add up to 25% jitter to each delay (less for small multipliers)
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with no retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Builder: set max attempts
    pub fn with_max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Builder: set initial delay
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Builder: set max delay
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Builder: set backoff multiplier
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier.max(1.0);
        self
    }

    /// Builder: enable/disable jitter
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before retry number `retry` (0-indexed)
    ///
    /// Jitter stays below half the growth step so consecutive delays keep
    /// growing.
    pub fn delay_for_retry(&self, retry: usize) -> Duration {
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let factor = self.backoff_multiplier.powi(exponent);
        let base = if factor.is_finite() {
            self.initial_delay
                .mul_f64(factor.clamp(0.0, self.ceiling_factor()))
        } else {
            self.max_delay
        };

        let delay = if self.jitter {
            let spread = if self.backoff_multiplier > 1.0 {
                ((self.backoff_multiplier - 1.0) / 2.0).min(0.25)
            } else {
                0.0
            };
            base.mul_f64(1.0 + spread * rand_jitter())
        } else {
            base
        };

        delay.min(self.max_delay)
    }

    /// Largest factor that still fits `max_delay`, keeping `mul_f64` in range
    fn ceiling_factor(&self) -> f64 {
        if self.initial_delay.is_zero() {
            return 1.0;
        }
        (self.max_delay.as_secs_f64() / self.initial_delay.as_secs_f64()).max(1.0)
    }

    /// Reject policies whose delays would not strictly grow
    ///
    /// The last retry's delay must still fit under `max_delay`, otherwise
    /// the cap would flatten the tail of the sequence.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.max_attempts == 0 {
            return Err(ParleyError::Configuration(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.initial_delay.is_zero() {
            return Err(ParleyError::Configuration(
                "retry.initial_delay must be greater than zero".to_string(),
            ));
        }
        if !(self.backoff_multiplier > 1.0 && self.backoff_multiplier.is_finite()) {
            return Err(ParleyError::Configuration(format!(
                "retry.backoff_multiplier must be greater than 1.0 (got {})",
                self.backoff_multiplier
            )));
        }
        if self.max_attempts > 1 {
            let last = i32::try_from(self.max_attempts - 2).unwrap_or(i32::MAX);
            let needed = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(last);
            if !(needed <= self.max_delay.as_secs_f64()) {
                return Err(ParleyError::Configuration(format!(
                    "retry.max_delay ({:?}) is below the last backoff delay ({:.3}s) for {} attempts",
                    self.max_delay, needed, self.max_attempts
                )));
            }
        }
        Ok(())
    }
}

/// Simple pseudo-random jitter (0.0 to 1.0)
fn rand_jitter() -> f64 {
    use std::sync::atomic::{AtomicU64, Ordering};
    static SEED: AtomicU64 = AtomicU64::new(0);

    // LCG parameters
    const A: u64 = 1103515245;
    const C: u64 = 12345;
    const M: u64 = 1 << 31;

    let seed = SEED.fetch_add(1, Ordering::Relaxed);
    let time_component = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);

    let next = (A.wrapping_mul(seed.wrapping_add(time_component)).wrapping_add(C)) % M;
    (next as f64) / (M as f64)
}

/// Attempt bookkeeping for one [`RetryExecutor::execute`] call
#[derive(Debug)]
pub struct RetryState {
    policy: RetryPolicy,
    attempt: usize,
    last_failure: Option<FailureClass>,
}

impl RetryState {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            attempt: 0,
            last_failure: None,
        }
    }

    /// Whether another attempt is allowed
    pub fn should_retry(&self) -> bool {
        self.attempt < self.policy.max_attempts
    }

    /// Record a failed attempt
    pub fn record_failure(&mut self, class: FailureClass) {
        self.attempt += 1;
        self.last_failure = Some(class);
    }

    /// Delay before the next attempt, honouring a server hint when longer
    pub fn next_delay(&self, retry_after: Option<Duration>) -> Duration {
        let computed = self.policy.delay_for_retry(self.attempt.saturating_sub(1));
        match retry_after {
            Some(hint) => computed.max(hint).min(self.policy.max_delay),
            None => computed,
        }
    }

    /// Number of attempts made so far
    pub fn current_attempt(&self) -> usize {
        self.attempt
    }

    pub fn remaining_attempts(&self) -> usize {
        self.policy.max_attempts.saturating_sub(self.attempt)
    }

    pub fn last_failure(&self) -> Option<FailureClass> {
        self.last_failure
    }
}

/// Where backoff delays are spent
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, delay: Duration);
}

/// Real wall-clock sleeping on the tokio timer
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, delay: Duration) {
        tokio::time::sleep(delay).await;
    }
}

/// Executes a remote operation under a [`RetryPolicy`]
#[derive(Clone)]
pub struct RetryExecutor {
    policy: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
}

impl std::fmt::Debug for RetryExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryExecutor")
            .field("policy", &self.policy)
            .finish()
    }
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            sleeper: Arc::new(TokioSleeper),
        }
    }

    /// Replace the sleeper (tests record delays instead of waiting)
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `operation` until it succeeds, fails fatally, or attempts run out.
    pub async fn execute<F, Fut, T>(&self, operation: F) -> Result<T, CompletionError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CompletionError>>,
    {
        self.run(operation, None).await
    }

    /// Like [`execute`](Self::execute), but a cancelled token aborts the
    /// current attempt or backoff and skips every remaining attempt.
    pub async fn execute_cancellable<F, Fut, T>(
        &self,
        operation: F,
        token: &CancellationToken,
    ) -> Result<T, CompletionError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CompletionError>>,
    {
        self.run(operation, Some(token)).await
    }

    async fn run<F, Fut, T>(
        &self,
        mut operation: F,
        cancel: Option<&CancellationToken>,
    ) -> Result<T, CompletionError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CompletionError>>,
    {
        let mut state = RetryState::new(self.policy.clone());

        loop {
            let outcome = match cancel {
                Some(token) if token.is_cancelled() => Err(CompletionError::cancelled()),
                Some(token) => tokio::select! {
                    biased;
                    _ = token.cancelled() => Err(CompletionError::cancelled()),
                    result = operation() => result,
                },
                None => operation().await,
            };

            let err = match outcome {
                Ok(value) => {
                    if state.current_attempt() > 0 {
                        tracing::debug!(
                            attempts = state.current_attempt() + 1,
                            "completion call succeeded after retry"
                        );
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            state.record_failure(err.class);

            if !err.is_retryable() {
                tracing::debug!(class = %err.class, "non-retryable completion failure");
                return Err(err);
            }

            if !state.should_retry() {
                tracing::warn!(
                    attempts = state.current_attempt(),
                    class = %err.class,
                    "retry attempts exhausted"
                );
                return Err(err);
            }

            let delay = state.next_delay(err.retry_after);
            tracing::warn!(
                attempt = state.current_attempt(),
                remaining = state.remaining_attempts(),
                delay = ?delay,
                class = %err.class,
                "retrying completion call"
            );

            match cancel {
                Some(token) => tokio::select! {
                    biased;
                    _ = token.cancelled() => return Err(CompletionError::cancelled()),
                    _ = self.sleeper.sleep(delay) => {}
                },
                None => self.sleeper.sleep(delay).await,
            }
        }
    }
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}
