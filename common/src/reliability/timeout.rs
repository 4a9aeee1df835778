use std::{future::Future, time::Duration};

use crate::error::PampaxError;

/// Operation classes with distinct ambient deadlines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationClass {
    Search,
    Assembly,
    Database,
    Cache,
    External,
}

impl OperationClass {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Search => "search",
            Self::Assembly => "assembly",
            Self::Database => "database",
            Self::Cache => "cache",
            Self::External => "external",
        }
    }

    pub const fn default_timeout(self) -> Duration {
        match self {
            Self::Search => Duration::from_secs(5),
            Self::Assembly => Duration::from_secs(10),
            Self::Database => Duration::from_secs(2),
            Self::Cache => Duration::from_secs(1),
            Self::External => Duration::from_secs(8),
        }
    }
}

/// Bound a future by its class deadline (or a per-call override). Elapsed
/// deadlines surface as `PampaxError::Timeout`.
pub async fn with_timeout<T, Fut>(
    class: OperationClass,
    override_timeout: Option<Duration>,
    fut: Fut,
) -> Result<T, PampaxError>
where
    Fut: Future<Output = Result<T, PampaxError>>,
{
    let deadline = override_timeout.unwrap_or_else(|| class.default_timeout());
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(PampaxError::Timeout(format!(
            "{} operation exceeded {}ms",
            class.as_str(),
            deadline.as_millis()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn deadlines_map_to_timeout_errors() {
        let result: Result<(), _> = with_timeout(
            OperationClass::Cache,
            Some(Duration::from_millis(10)),
            async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            },
        )
        .await;

        match result {
            Err(PampaxError::Timeout(message)) => assert!(message.contains("cache")),
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn fast_operations_pass_through() {
        let result = with_timeout(OperationClass::Cache, None, async { Ok(7) }).await;
        assert_eq!(result.expect("ok"), 7);
    }
}
