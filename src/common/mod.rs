//! Shared client plumbing: rate limiting and fault tolerance
//!
//! Both are wrapped around every exchange call: the token bucket keeps us
//! inside the API weight limits, the circuit breaker stops hammering an
//! exchange that is already failing.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;

// =============================================================================
// Rate Limiter
// =============================================================================

/// Token-bucket rate limiter, permits refilled once per interval
#[derive(Debug)]
pub struct RateLimiter {
    permits: Arc<Semaphore>,
    max_permits: usize,
    last_refill: Arc<Mutex<Instant>>,
    refill_interval: Duration,
}

impl RateLimiter {
    /// Limiter allowing `requests_per_second` calls per second
    pub fn new(requests_per_second: usize) -> Self {
        RateLimiter {
            permits: Arc::new(Semaphore::new(requests_per_second)),
            max_permits: requests_per_second,
            last_refill: Arc::new(Mutex::new(Instant::now())),
            refill_interval: Duration::from_secs(1),
        }
    }

    /// Acquire a permit, waiting for the next refill when exhausted
    pub async fn acquire(&self) {
        self.try_refill().await;

        let permit = self
            .permits
            .acquire()
            .await
            .expect("Semaphore should not be closed");
        permit.forget();
    }

    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    async fn try_refill(&self) {
        let mut last_refill = self.last_refill.lock().await;
        let elapsed = last_refill.elapsed();

        if elapsed >= self.refill_interval {
            let current = self.permits.available_permits();
            let to_add = self.max_permits.saturating_sub(current);
            if to_add > 0 {
                self.permits.add_permits(to_add);
            }
            *last_refill = Instant::now();
        }
    }
}

impl Clone for RateLimiter {
    fn clone(&self) -> Self {
        RateLimiter {
            permits: Arc::clone(&self.permits),
            max_permits: self.max_permits,
            last_refill: Arc::clone(&self.last_refill),
            refill_interval: self.refill_interval,
        }
    }
}

// =============================================================================
// Circuit Breaker
// =============================================================================

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CircuitState {
    /// Normal operation, requests pass through
    #[default]
    Closed,
    /// Service is failing, requests are rejected immediately
    Open,
    /// Testing whether the service has recovered
    HalfOpen,
}

/// Circuit breaker guarding the exchange client
///
/// Opens after `failure_threshold` consecutive failures; after `timeout`
/// a half-open probe is allowed, and `success_threshold` consecutive
/// successes close it again.
#[derive(Debug)]
pub struct CircuitBreaker {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    failure_threshold: u32,
    success_threshold: u32,
    timeout: Duration,
    last_failure_time: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, success_threshold: u32, timeout: Duration) -> Self {
        CircuitBreaker {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            failure_threshold,
            success_threshold,
            timeout,
            last_failure_time: None,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(5, 2, Duration::from_secs(60))
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    /// Whether a request attempt is currently allowed
    pub fn can_attempt(&mut self) -> bool {
        match self.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => match self.last_failure_time {
                Some(last) if last.elapsed() >= self.timeout => {
                    tracing::info!("Circuit breaker transitioning to half-open");
                    self.state = CircuitState::HalfOpen;
                    self.failure_count = 0;
                    self.success_count = 0;
                    true
                }
                Some(_) => false,
                None => true,
            },
        }
    }

    pub fn record_success(&mut self) {
        match self.state {
            CircuitState::Closed => {
                self.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                self.success_count += 1;
                if self.success_count >= self.success_threshold {
                    tracing::info!("Circuit breaker closed after recovery");
                    self.state = CircuitState::Closed;
                    self.failure_count = 0;
                    self.success_count = 0;
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&mut self) {
        self.last_failure_time = Some(Instant::now());

        match self.state {
            CircuitState::Closed => {
                self.failure_count += 1;
                if self.failure_count >= self.failure_threshold {
                    tracing::warn!(failures = self.failure_count, "Circuit breaker opened");
                    self.state = CircuitState::Open;
                }
            }
            CircuitState::HalfOpen => {
                tracing::warn!("Circuit breaker re-opened from half-open");
                self.state = CircuitState::Open;
                self.failure_count = 0;
                self.success_count = 0;
            }
            CircuitState::Open => {}
        }
    }
}
