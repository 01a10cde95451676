//! Retry backoff and the process-wide circuit breaker.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, warn};

/// Backoff between drain rounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Initial delay in milliseconds.
    pub initial_delay_ms: u64,
    /// Upper bound for a single delay in milliseconds.
    pub max_delay_ms: u64,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add up to 25% jitter.
    pub use_jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 2000,
            max_delay_ms: 30000,
            backoff_multiplier: 2.0,
            use_jitter: true,
        }
    }
}

impl RetryConfig {
    /// Delay before the given attempt; attempt 0 has none.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_delay = self.initial_delay_ms as f64
            * self
                .backoff_multiplier
                .powi(attempt.saturating_sub(1).min(i32::MAX as u32) as i32);

        let delay_ms = base_delay.min(self.max_delay_ms as f64) as u64;

        let final_delay = if self.use_jitter {
            let jitter = (delay_ms as f64 * 0.25 * rand::random::<f64>()) as u64;
            delay_ms + jitter
        } else {
            delay_ms
        };

        Duration::from_millis(final_delay)
    }
}

/// State of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Accepting new executions.
    Closed,
    /// Rejecting new executions until the cooldown elapses.
    Open,
}

/// Stops admitting job executions after a burst of failures.
///
/// There is no half-open trial: once the cooldown has elapsed since the last
/// failure, the next [`can_proceed`](Self::can_proceed) resets the count and
/// admits everything again.
pub struct CircuitBreaker {
    failures: AtomicU32,
    last_failure: RwLock<Option<Instant>>,
    failure_threshold: u32,
    cooldown: Duration,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            failures: AtomicU32::new(0),
            last_failure: RwLock::new(None),
            failure_threshold: failure_threshold.max(1),
            cooldown,
        }
    }

    /// Whether a new execution may start.
    pub fn can_proceed(&self) -> bool {
        if self.failures.load(Ordering::SeqCst) < self.failure_threshold {
            return true;
        }

        let mut last_failure = self.last_failure.write();
        // Another caller may have reset while we waited for the lock.
        if self.failures.load(Ordering::SeqCst) < self.failure_threshold {
            return true;
        }

        match *last_failure {
            Some(at) if at.elapsed() > self.cooldown => {
                self.failures.store(0, Ordering::SeqCst);
                *last_failure = None;
                info!("Circuit breaker cooldown elapsed, accepting work again");
                true
            }
            Some(_) => false,
            None => {
                self.failures.store(0, Ordering::SeqCst);
                true
            }
        }
    }

    pub fn record_failure(&self) {
        let mut last_failure = self.last_failure.write();
        let failures = self.failures.fetch_add(1, Ordering::SeqCst) + 1;
        *last_failure = Some(Instant::now());
        if failures == self.failure_threshold {
            warn!(
                failures,
                cooldown_ms = self.cooldown.as_millis() as u64,
                "Circuit breaker opened"
            );
        }
    }

    pub fn record_success(&self) {
        self.failures.store(0, Ordering::SeqCst);
    }

    pub fn failures(&self) -> u32 {
        self.failures.load(Ordering::SeqCst)
    }

    /// Current state without applying the lazy cooldown reset.
    pub fn state(&self) -> CircuitState {
        if self.failures() < self.failure_threshold {
            CircuitState::Closed
        } else {
            CircuitState::Open
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(60))
    }
}
