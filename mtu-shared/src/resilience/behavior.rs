//! Circuit breaker behavior shared by anything that guards repeated sends to
//! an RTU or a subscriber socket.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Current state of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Point-in-time snapshot of a circuit breaker's counters.
#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerMetrics {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub total_successes: u64,
    pub total_failures: u64,
}

/// Unified interface for anything that gates repeated attempts at a flaky
/// operation (sending to an RTU, forwarding to a subscriber socket).
///
/// Object-safe so health reporting can hold a `&dyn CircuitBreakerBehavior`
/// over a heterogeneous set of breakers without knowing their concrete type.
pub trait CircuitBreakerBehavior: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;
    fn state(&self) -> CircuitState;
    fn should_allow(&self) -> bool;
    fn record_success(&self);
    fn record_failure(&self);
    fn is_healthy(&self) -> bool;
    fn force_open(&self);
    fn force_closed(&self);
    fn metrics(&self) -> CircuitBreakerMetrics;
}

/// Breaker that trips after a configurable run of consecutive send failures
/// to one RTU and recovers after a cooldown, guarding the per-point retry
/// loop from hammering an RTU that is simply down.
#[derive(Debug)]
pub struct RtuCircuitBreaker {
    name: String,
    failure_threshold: u32,
    recovery_timeout: Duration,
    state: std::sync::Mutex<CircuitState>,
    opened_at: std::sync::Mutex<Option<Instant>>,
    consecutive_failures: AtomicU32,
    total_successes: AtomicU64,
    total_failures: AtomicU64,
}

impl RtuCircuitBreaker {
    #[must_use]
    pub fn new(name: impl Into<String>, failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            failure_threshold,
            recovery_timeout,
            state: std::sync::Mutex::new(CircuitState::Closed),
            opened_at: std::sync::Mutex::new(None),
            consecutive_failures: AtomicU32::new(0),
            total_successes: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
        }
    }
}

impl CircuitBreakerBehavior for RtuCircuitBreaker {
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> CircuitState {
        *self.state.lock().expect("circuit breaker mutex poisoned")
    }

    fn should_allow(&self) -> bool {
        let mut state = self.state.lock().expect("circuit breaker mutex poisoned");
        match *state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = self
                    .opened_at
                    .lock()
                    .expect("circuit breaker mutex poisoned")
                    .map(|t| t.elapsed())
                    .unwrap_or_default();
                if elapsed >= self.recovery_timeout {
                    *state = CircuitState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    fn record_success(&self) {
        self.total_successes.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::Relaxed);
        *self.state.lock().expect("circuit breaker mutex poisoned") = CircuitState::Closed;
    }

    fn record_failure(&self) {
        self.total_failures.fetch_add(1, Ordering::Relaxed);
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures >= self.failure_threshold {
            *self.state.lock().expect("circuit breaker mutex poisoned") = CircuitState::Open;
            *self.opened_at.lock().expect("circuit breaker mutex poisoned") = Some(Instant::now());
        }
    }

    fn is_healthy(&self) -> bool {
        self.state() != CircuitState::Open
    }

    fn force_open(&self) {
        *self.state.lock().expect("circuit breaker mutex poisoned") = CircuitState::Open;
        *self.opened_at.lock().expect("circuit breaker mutex poisoned") = Some(Instant::now());
    }

    fn force_closed(&self) {
        *self.state.lock().expect("circuit breaker mutex poisoned") = CircuitState::Closed;
        self.consecutive_failures.store(0, Ordering::Relaxed);
    }

    fn metrics(&self) -> CircuitBreakerMetrics {
        CircuitBreakerMetrics {
            state: self.state(),
            consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed),
            total_successes: self.total_successes.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn _assert_object_safe(_: &dyn CircuitBreakerBehavior) {}

    #[test]
    fn opens_after_threshold_failures() {
        let breaker = RtuCircuitBreaker::new("rtu-14", 3, Duration::from_secs(60));
        assert!(breaker.should_allow());
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.should_allow());
    }

    #[test]
    fn success_resets_consecutive_failures() {
        let breaker = RtuCircuitBreaker::new("rtu-14", 3, Duration::from_secs(60));
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        assert_eq!(breaker.metrics().consecutive_failures, 0);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn half_opens_after_recovery_timeout() {
        let breaker = RtuCircuitBreaker::new("rtu-14", 1, Duration::from_millis(1));
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        std::thread::sleep(Duration::from_millis(5));
        assert!(breaker.should_allow());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }
}
