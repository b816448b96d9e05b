//! Retry with exponential backoff, and a circuit breaker, for remote calls.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::{CircuitConfig, RetryConfig};
use crate::{Error, Result};

/// Exponential backoff with symmetric jitter.
pub struct RetryPolicy {
    max_attempts: u32,
    base: Duration,
    cap: Duration,
    jitter: f64,
    rng: Mutex<StdRng>,
}

impl RetryPolicy {
    pub fn new(config: &RetryConfig) -> Self {
        Self::with_rng(config, StdRng::from_os_rng())
    }

    pub fn seeded(config: &RetryConfig, seed: u64) -> Self {
        Self::with_rng(config, StdRng::seed_from_u64(seed))
    }

    fn with_rng(config: &RetryConfig, rng: StdRng) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base: Duration::from_millis(config.base_delay_ms),
            cap: Duration::from_millis(config.max_delay_ms),
            jitter: config.jitter.clamp(0.0, 0.99),
            rng: Mutex::new(rng),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// `min(base * 2^retry, cap)` before jitter; `retry` counts from 0.
    pub fn base_delay(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.min(31));
        self.base.saturating_mul(factor).min(self.cap)
    }

    /// Delay before retry number `retry`, jittered.
    pub fn delay(&self, retry: u32) -> Duration {
        let base = self.base_delay(retry).as_secs_f64();
        if self.jitter == 0.0 || base == 0.0 {
            return Duration::from_secs_f64(base);
        }
        let factor = {
            let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
            rng.random_range(1.0 - self.jitter..=1.0 + self.jitter)
        };
        Duration::from_secs_f64(base * factor)
    }
}

/// Failure bookkeeping of a [`CircuitBreaker`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CircuitState {
    pub consecutive_failures: u32,
    pub open_until: Option<Instant>,
}

/// Stops calling a failing service for a cooldown window.
///
/// Closed until `threshold` consecutive failures, then open for `cooldown`.
/// Once the window passes the next call goes through as a probe. The
/// failure count is kept, so a failed probe reopens the circuit at once and
/// a successful one resets it.
pub struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    state: Mutex<CircuitState>,
}

impl CircuitBreaker {
    pub fn new(config: &CircuitConfig) -> Self {
        Self {
            threshold: config.failure_threshold.max(1),
            cooldown: Duration::from_millis(config.cooldown_ms),
            state: Mutex::new(CircuitState::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CircuitState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> CircuitState {
        *self.lock()
    }

    pub fn is_open(&self) -> bool {
        self.lock().open_until.is_some_and(|t| t > Instant::now())
    }

    /// Fail fast while open; close the circuit once the cooldown is over.
    pub fn check(&self) -> Result<()> {
        let mut state = self.lock();
        match state.open_until {
            Some(until) if until > Instant::now() => Err(Error::CircuitOpen {
                remaining_ms: (until - Instant::now()).as_millis() as u64,
            }),
            Some(_) => {
                debug!("circuit cooldown over, allowing probe");
                state.open_until = None;
                Ok(())
            }
            None => Ok(()),
        }
    }

    pub fn record_success(&self) {
        *self.lock() = CircuitState::default();
    }

    pub fn record_failure(&self) {
        let mut state = self.lock();
        state.consecutive_failures += 1;
        if state.consecutive_failures >= self.threshold {
            warn!(
                failures = state.consecutive_failures,
                cooldown_ms = self.cooldown.as_millis() as u64,
                "circuit open"
            );
            state.open_until = Some(Instant::now() + self.cooldown);
        }
    }
}

/// Run `call` under the breaker, retrying retryable failures with backoff.
///
/// An open circuit fails immediately and is never retried. The last
/// failure after `max_attempts` is wrapped in [`Error::RetriesExhausted`].
pub async fn call_with_retry<T, F, Fut>(
    operation: &str,
    retry: &RetryPolicy,
    breaker: &CircuitBreaker,
    mut call: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        breaker.check()?;
        match call(attempt).await {
            Ok(value) => {
                breaker.record_success();
                return Ok(value);
            }
            Err(e) => {
                breaker.record_failure();
                attempt += 1;
                warn!(operation, attempt, error = %e, "attempt failed");
                if !e.is_retryable() {
                    return Err(e);
                }
                if attempt >= retry.max_attempts() {
                    return Err(Error::RetriesExhausted {
                        operation: operation.to_string(),
                        attempts: attempt,
                        source: Box::new(e),
                    });
                }
                let delay = retry.delay(attempt - 1);
                debug!(operation, delay_ms = delay.as_millis() as u64, "backing off");
                tokio::time::sleep(delay).await;
            }
        }
    }
}
