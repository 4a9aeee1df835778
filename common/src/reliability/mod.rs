//! Reliability wrappers applied at every outbound boundary: per-class
//! timeouts, retries with backoff, circuit breakers, bulkheads, and the
//! graceful-degradation ladder.

pub mod breaker;
pub mod bulkhead;
pub mod degradation;
pub mod retry;
pub mod timeout;

pub use breaker::{BreakerConfig, BreakerState, CircuitBreaker};
pub use bulkhead::Bulkhead;
pub use degradation::{DegradationManager, ServiceLevel, StrategyKind};
pub use retry::{retry, Backoff, RetryPolicy};
pub use timeout::{with_timeout, OperationClass};
