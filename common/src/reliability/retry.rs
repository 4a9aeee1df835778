use std::{future::Future, time::Duration};

use tokio_retry::{strategy::jitter, RetryIf};

use crate::error::PampaxError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Fixed,
    Linear,
    Exponential,
}

/// Retry schedule for transient failures. Only errors classified as
/// retryable (`Timeout`, `Unavailable`, `RateLimited`) are retried.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub backoff: Backoff,
    pub base_delay: Duration,
    pub max_retries: usize,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff: Backoff::Exponential,
            base_delay: Duration::from_millis(100),
            max_retries: 3,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    fn delays(&self) -> Vec<Duration> {
        (0..self.max_retries)
            .map(|attempt| {
                let raw = match self.backoff {
                    Backoff::Fixed => self.base_delay,
                    Backoff::Linear => self.base_delay * (attempt as u32 + 1),
                    Backoff::Exponential => self.base_delay * 2u32.saturating_pow(attempt as u32),
                };
                if self.jitter {
                    jitter(raw)
                } else {
                    raw
                }
            })
            .collect()
    }
}

/// Run `op` with the policy's schedule, retrying transient errors only.
pub async fn retry<F, Fut, T>(policy: &RetryPolicy, op: F) -> Result<T, PampaxError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, PampaxError>>,
{
    RetryIf::spawn(policy.delays(), op, |err: &PampaxError| err.is_retryable()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            backoff: Backoff::Fixed,
            base_delay: Duration::from_millis(1),
            max_retries: 3,
            jitter: false,
        }
    }

    #[tokio::test]
    async fn transient_errors_are_retried_until_success() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);

        let result = retry(&fast_policy(), move || {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(PampaxError::Unavailable("flaky".to_string()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.expect("recovered"), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);

        let result: Result<(), _> = retry(&fast_policy(), move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(PampaxError::InvalidInput("bad".to_string()))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn schedules_grow_by_backoff_kind() {
        let linear = RetryPolicy {
            backoff: Backoff::Linear,
            base_delay: Duration::from_millis(10),
            max_retries: 3,
            jitter: false,
        };
        assert_eq!(
            linear.delays(),
            vec![
                Duration::from_millis(10),
                Duration::from_millis(20),
                Duration::from_millis(30),
            ]
        );

        let exponential = RetryPolicy {
            backoff: Backoff::Exponential,
            base_delay: Duration::from_millis(10),
            max_retries: 3,
            jitter: false,
        };
        assert_eq!(
            exponential.delays(),
            vec![
                Duration::from_millis(10),
                Duration::from_millis(20),
                Duration::from_millis(40),
            ]
        );
    }
}
