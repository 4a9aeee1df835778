use std::{future::Future, sync::Arc};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::PampaxError;

/// Caps concurrent operations of one class. Over-limit callers fail fast
/// with `Exhausted` instead of queueing.
#[derive(Debug)]
pub struct Bulkhead {
    name: String,
    permits: Arc<Semaphore>,
    capacity: usize,
}

impl Bulkhead {
    pub fn new(name: &str, capacity: usize) -> Self {
        Self {
            name: name.to_owned(),
            permits: Arc::new(Semaphore::new(capacity.max(1))),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn try_acquire(&self) -> Result<OwnedSemaphorePermit, PampaxError> {
        Arc::clone(&self.permits).try_acquire_owned().map_err(|_| {
            PampaxError::Exhausted(format!(
                "bulkhead '{}' at capacity ({})",
                self.name, self.capacity
            ))
        })
    }

    /// Run a future inside the bulkhead; the permit is held for its whole
    /// duration.
    pub async fn run<T, Fut>(&self, fut: Fut) -> Result<T, PampaxError>
    where
        Fut: Future<Output = Result<T, PampaxError>>,
    {
        let _permit = self.try_acquire()?;
        fut.await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn over_limit_calls_fail_fast() {
        let bulkhead = Bulkhead::new("external", 2);
        let first = bulkhead.try_acquire().expect("first");
        let _second = bulkhead.try_acquire().expect("second");

        match bulkhead.try_acquire() {
            Err(PampaxError::Exhausted(message)) => assert!(message.contains("external")),
            other => panic!("expected exhausted, got {other:?}"),
        }

        drop(first);
        assert!(bulkhead.try_acquire().is_ok(), "released permit is reusable");
    }
}
