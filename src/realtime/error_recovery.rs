//! Error recovery primitives for streaming connections.
//!
//! Both types are plain synchronous state: callers pass the current instant in, so
//! behaviour is deterministic under test and tokio's paused clock.

use log::{error, info};
use rand::Rng;
use std::time::Duration;
use tokio::time::Instant;

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Stops connection attempts after repeated failures until a cooldown elapses.
///
/// After the cooldown exactly one trial attempt is let through (half-open). A
/// success closes the breaker, a failure re-opens it for another full cooldown.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    state: CircuitState,
    failure_count: u32,
    failure_threshold: u32,
    timeout: Duration,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, timeout: Duration) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            failure_threshold: failure_threshold.max(1),
            timeout,
            opened_at: None,
            trial_in_flight: false,
        }
    }

    /// Ask permission for one attempt. On refusal the remaining cooldown is returned.
    pub fn try_acquire(&mut self, now: Instant) -> Result<(), Duration> {
        match self.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let remaining = self.remaining(now);
                if remaining.is_zero() {
                    self.state = CircuitState::HalfOpen;
                    self.trial_in_flight = true;
                    info!("Circuit breaker half-open, allowing one trial attempt");
                    Ok(())
                } else {
                    Err(remaining)
                }
            }
            CircuitState::HalfOpen => {
                if self.trial_in_flight {
                    Err(Duration::ZERO)
                } else {
                    self.trial_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    pub fn record_success(&mut self) {
        if self.state != CircuitState::Closed {
            info!("Circuit breaker closed - connection recovered");
        }
        self.state = CircuitState::Closed;
        self.failure_count = 0;
        self.opened_at = None;
        self.trial_in_flight = false;
    }

    pub fn record_failure(&mut self, now: Instant) {
        self.failure_count = self.failure_count.saturating_add(1);
        self.trial_in_flight = false;
        match self.state {
            CircuitState::HalfOpen => {
                self.state = CircuitState::Open;
                self.opened_at = Some(now);
                error!("Circuit breaker re-opened - trial attempt failed");
            }
            CircuitState::Closed if self.failure_count >= self.failure_threshold => {
                self.state = CircuitState::Open;
                self.opened_at = Some(now);
                error!(
                    "Circuit breaker opened after {} consecutive failures",
                    self.failure_count
                );
            }
            _ => {}
        }
    }

    /// Cooldown left before the half-open trial; zero when not open
    pub fn remaining(&self, now: Instant) -> Duration {
        match (self.state, self.opened_at) {
            (CircuitState::Open, Some(opened)) => {
                self.timeout.saturating_sub(now.saturating_duration_since(opened))
            }
            _ => Duration::ZERO,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }
}

/// Exponential backoff with symmetric jitter:
/// `expected(n) = min(max_delay, initial_delay * multiplier^(n-1))`, perturbed by
/// up to `±jitter_factor * expected(n)`.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub jitter_factor: f64,
}

impl BackoffPolicy {
    pub fn new(initial_delay: Duration, multiplier: f64, max_delay: Duration, jitter: f64) -> Self {
        Self {
            initial_delay,
            multiplier: multiplier.max(1.0),
            max_delay,
            jitter_factor: jitter.clamp(0.0, 1.0),
        }
    }

    /// Un-jittered delay for the 1-based attempt number
    pub fn expected_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(64) as i32;
        let millis = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped.round() as u64)
    }

    /// Jittered delay for the 1-based attempt number
    pub fn delay<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let expected = self.expected_delay(attempt).as_millis() as f64;
        if self.jitter_factor == 0.0 || expected == 0.0 {
            return Duration::from_millis(expected as u64);
        }
        let spread = expected * self.jitter_factor;
        let jittered = rng.gen_range((expected - spread)..=(expected + spread));
        Duration::from_millis(jittered.round().max(0.0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn policy() -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_millis(1000),
            1.5,
            Duration::from_millis(30_000),
            0.2,
        )
    }

    #[test]
    fn test_expected_delay_grows_then_caps() {
        let policy = policy();
        assert_eq!(policy.expected_delay(1), Duration::from_millis(1000));
        assert_eq!(policy.expected_delay(2), Duration::from_millis(1500));
        assert_eq!(policy.expected_delay(3), Duration::from_millis(2250));
        assert_eq!(policy.expected_delay(20), Duration::from_millis(30_000));
        assert_eq!(policy.expected_delay(500), Duration::from_millis(30_000));
    }

    proptest! {
        #[test]
        fn prop_jittered_delay_stays_in_band(attempt in 1u32..40, seed in any::<u64>()) {
            let policy = policy();
            let mut rng = StdRng::seed_from_u64(seed);
            let expected = policy.expected_delay(attempt).as_millis() as f64;
            let delay = policy.delay(attempt, &mut rng).as_millis() as f64;
            // +/-1ms for rounding
            prop_assert!(delay >= expected * 0.8 - 1.0);
            prop_assert!(delay <= expected * 1.2 + 1.0);
        }
    }

    #[test]
    fn test_circuit_breaker_opens_at_threshold() {
        let start = Instant::now();
        let mut cb = CircuitBreaker::new(3, Duration::from_secs(60));

        cb.record_failure(start);
        cb.record_failure(start);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.try_acquire(start).is_ok());

        cb.record_failure(start);
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.try_acquire(start), Err(Duration::from_secs(60)));
    }

    #[test]
    fn test_circuit_breaker_single_half_open_trial() {
        let start = Instant::now();
        let mut cb = CircuitBreaker::new(2, Duration::from_secs(10));
        cb.record_failure(start);
        cb.record_failure(start);

        let later = start + Duration::from_secs(10);
        assert!(cb.try_acquire(later).is_ok());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        // second caller during the trial is refused
        assert!(cb.try_acquire(later).is_err());

        cb.record_failure(later);
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.remaining(later), Duration::from_secs(10));

        let after = later + Duration::from_secs(10);
        assert!(cb.try_acquire(after).is_ok());
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 0);
    }
}
