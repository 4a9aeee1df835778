use std::{
    future::Future,
    sync::Mutex,
    time::{Duration, Instant},
};

use tracing::warn;

use crate::error::PampaxError;

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures that trip the breaker.
    pub failure_threshold: u32,
    /// Cool-down before probes are admitted.
    pub recovery_timeout: Duration,
    /// Probe successes required to close again.
    pub success_threshold: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            success_threshold: 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
enum State {
    Closed { failures: u32 },
    Open { since: Instant },
    HalfOpen { successes: u32 },
}

/// Classic closed → open → half-open circuit breaker guarding one
/// external dependency.
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    state: Mutex<State>,
}

impl CircuitBreaker {
    pub fn new(name: &str, config: BreakerConfig) -> Self {
        Self {
            name: name.to_owned(),
            config,
            state: Mutex::new(State::Closed { failures: 0 }),
        }
    }

    pub fn state(&self) -> BreakerState {
        match self.state.lock() {
            Ok(guard) => match &*guard {
                State::Closed { .. } => BreakerState::Closed,
                State::Open { .. } => BreakerState::Open,
                State::HalfOpen { .. } => BreakerState::HalfOpen,
            },
            Err(_) => BreakerState::Open,
        }
    }

    /// Admission check. Flips open breakers to half-open once the cool-down
    /// elapsed; rejects with `Unavailable` otherwise.
    pub fn try_acquire(&self) -> Result<(), PampaxError> {
        let mut guard = self
            .state
            .lock()
            .map_err(|_| PampaxError::Internal("breaker lock poisoned".to_string()))?;
        match &*guard {
            State::Closed { .. } | State::HalfOpen { .. } => Ok(()),
            State::Open { since } => {
                if since.elapsed() >= self.config.recovery_timeout {
                    *guard = State::HalfOpen { successes: 0 };
                    Ok(())
                } else {
                    Err(PampaxError::Unavailable(format!(
                        "circuit '{}' is open",
                        self.name
                    )))
                }
            }
        }
    }

    pub fn record_success(&self) {
        if let Ok(mut guard) = self.state.lock() {
            match &mut *guard {
                State::Closed { failures } => *failures = 0,
                State::HalfOpen { successes } => {
                    *successes += 1;
                    if *successes >= self.config.success_threshold {
                        *guard = State::Closed { failures: 0 };
                    }
                }
                State::Open { .. } => {}
            }
        }
    }

    pub fn record_failure(&self) {
        if let Ok(mut guard) = self.state.lock() {
            match &mut *guard {
                State::Closed { failures } => {
                    *failures += 1;
                    if *failures >= self.config.failure_threshold {
                        warn!(breaker = %self.name, "Circuit opened");
                        *guard = State::Open {
                            since: Instant::now(),
                        };
                    }
                }
                State::HalfOpen { .. } => {
                    warn!(breaker = %self.name, "Probe failed; circuit re-opened");
                    *guard = State::Open {
                        since: Instant::now(),
                    };
                }
                State::Open { .. } => {}
            }
        }
    }

    /// Run a future under the breaker, recording its outcome.
    pub async fn call<T, Fut>(&self, fut: Fut) -> Result<T, PampaxError>
    where
        Fut: Future<Output = Result<T, PampaxError>>,
    {
        self.try_acquire()?;
        match fut.await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                self.record_failure();
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, recovery: Duration) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            BreakerConfig {
                failure_threshold: threshold,
                recovery_timeout: recovery,
                success_threshold: 2,
            },
        )
    }

    #[test]
    fn opens_after_the_failure_threshold() {
        let breaker = breaker(2, Duration::from_secs(60));
        assert_eq!(breaker.state(), BreakerState::Closed);
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(breaker.try_acquire().is_err());
    }

    #[test]
    fn half_open_closes_after_enough_probe_successes() {
        let breaker = breaker(1, Duration::from_millis(0));
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);

        // Cool-down of zero admits the next call as a probe.
        breaker.try_acquire().expect("probe admitted");
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn a_failed_probe_reopens() {
        let breaker = breaker(1, Duration::from_millis(0));
        breaker.record_failure();
        breaker.try_acquire().expect("probe admitted");
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
    }
}
