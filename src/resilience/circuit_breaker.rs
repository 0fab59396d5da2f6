//! Circuit breaker.
//!
//! - **Closed**: calls pass; consecutive failures are counted
//! - **Open**: calls fail fast with `CircuitOpen` until the cool-down elapses
//! - **HalfOpen**: one trial call is let through; its outcome closes or
//!   reopens the circuit
//!
//! Admission hands out a [`Permit`]. A trial permit that is dropped without
//! an outcome (cancelled or abandoned call) frees the slot and leaves the
//! circuit half-open for the next caller.

use crate::error::{DbError, DbResult};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CircuitState {
    Closed = 0,
    Open = 1,
    HalfOpen = 2,
}

impl From<u8> for CircuitState {
    fn from(value: u8) -> Self {
        match value {
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// How long the circuit stays open before a trial call is allowed
    pub cool_down: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cool_down: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: AtomicU8,
    failures: AtomicU32,
    trial_in_flight: AtomicBool,
    opened_at: RwLock<Instant>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: AtomicU8::new(CircuitState::Closed as u8),
            failures: AtomicU32::new(0),
            trial_in_flight: AtomicBool::new(false),
            opened_at: RwLock::new(Instant::now()),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn state(&self) -> CircuitState {
        self.state.load(Ordering::SeqCst).into()
    }

    /// Consecutive failures counted while closed.
    pub fn failure_count(&self) -> u32 {
        self.failures.load(Ordering::SeqCst)
    }

    /// Admit a call, or fail fast while the circuit is open.
    pub fn try_acquire(&self) -> DbResult<Permit<'_>> {
        match self.state() {
            CircuitState::Closed => Ok(Permit::new(self, false)),
            CircuitState::Open => {
                let elapsed = self.opened_at.read().elapsed();
                if elapsed < self.config.cool_down {
                    let remaining = self.config.cool_down - elapsed;
                    return Err(DbError::circuit_open(remaining.as_millis() as u64));
                }
                self.transition_to(CircuitState::HalfOpen);
                self.try_trial()
            }
            CircuitState::HalfOpen => self.try_trial(),
        }
    }

    fn try_trial(&self) -> DbResult<Permit<'_>> {
        if self
            .trial_in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            Ok(Permit::new(self, true))
        } else {
            Err(DbError::circuit_open(0))
        }
    }

    pub fn record_success(&self) {
        match self.state() {
            CircuitState::HalfOpen => {
                info!("Circuit breaker trial call succeeded, closing");
                self.transition_to(CircuitState::Closed);
            }
            _ => self.failures.store(0, Ordering::SeqCst),
        }
    }

    pub fn record_failure(&self) {
        match self.state() {
            CircuitState::Closed => {
                let count = self.failures.fetch_add(1, Ordering::SeqCst) + 1;
                if count >= self.config.failure_threshold {
                    warn!(
                        failures = count,
                        cool_down_ms = self.config.cool_down.as_millis() as u64,
                        "Circuit breaker opened"
                    );
                    self.transition_to(CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                warn!("Circuit breaker trial call failed, reopening");
                self.transition_to(CircuitState::Open);
            }
            CircuitState::Open => {}
        }
    }

    pub fn reset(&self) {
        self.transition_to(CircuitState::Closed);
    }

    fn transition_to(&self, new_state: CircuitState) {
        let old_state = self.state.swap(new_state as u8, Ordering::SeqCst);
        if old_state == new_state as u8 {
            return;
        }
        self.trial_in_flight.store(false, Ordering::SeqCst);
        match new_state {
            CircuitState::Closed => self.failures.store(0, Ordering::SeqCst),
            CircuitState::Open => *self.opened_at.write() = Instant::now(),
            CircuitState::HalfOpen => {}
        }
    }
}

/// Admission to one call. Resolve it with [`Permit::succeeded`] or
/// [`Permit::failed`]; dropping it unresolved records nothing.
#[derive(Debug)]
#[must_use = "an unresolved permit records no outcome"]
pub struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
}

impl<'a> Permit<'a> {
    fn new(breaker: &'a CircuitBreaker, trial: bool) -> Self {
        Self { breaker, trial }
    }

    /// Whether this is the single half-open trial call.
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    /// The backend answered. Closes a half-open circuit.
    pub fn succeeded(self) {
        self.breaker.record_success();
    }

    /// The backend is unhealthy. Reopens a half-open circuit.
    pub fn failed(self) {
        self.breaker.record_failure();
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if self.trial
            && self.breaker.state() == CircuitState::HalfOpen
            && self.breaker.trial_in_flight.swap(false, Ordering::SeqCst)
        {
            debug!("Circuit breaker trial call abandoned");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, cool_down: Duration) -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: threshold,
            cool_down,
        })
    }

    #[test]
    fn test_opens_after_consecutive_failures() {
        let cb = breaker(3, Duration::from_secs(60));
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_success();
        assert_eq!(cb.failure_count(), 0);

        for _ in 0..3 {
            cb.record_failure();
        }
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(matches!(cb.try_acquire(), Err(DbError::CircuitOpen { .. })));
    }

    #[test]
    fn test_single_trial_after_cool_down() {
        let cb = breaker(1, Duration::ZERO);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);

        let trial = cb.try_acquire().unwrap();
        assert!(trial.is_trial());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.try_acquire().is_err());

        trial.succeeded();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(!cb.try_acquire().unwrap().is_trial());
    }

    #[test]
    fn test_failed_trial_reopens() {
        let cb = breaker(1, Duration::from_millis(50));
        cb.record_failure();
        std::thread::sleep(Duration::from_millis(60));

        cb.try_acquire().unwrap().failed();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(matches!(
            cb.try_acquire(),
            Err(DbError::CircuitOpen { .. })
        ));
    }

    #[test]
    fn test_abandoned_trial_frees_the_slot() {
        let cb = breaker(1, Duration::ZERO);
        cb.record_failure();

        drop(cb.try_acquire().unwrap());
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        let next = cb.try_acquire().unwrap();
        assert!(next.is_trial());
        next.succeeded();
        assert_eq!(cb.state(), CircuitState::Closed);
    }
}
