use thiserror::Error;
use tokio::task::JoinError;

use crate::storage::StoreError;

/// Stable error taxonomy shared by every component. Each kind carries a
/// numeric code so wire payloads and logs stay comparable across versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidInput,
    NotFound,
    Conflict,
    Integrity,
    Timeout,
    Cancelled,
    RateLimited,
    Unavailable,
    Exhausted,
    Internal,
}

impl ErrorKind {
    /// Stable numeric code for wire payloads.
    pub const fn code(self) -> u16 {
        match self {
            Self::InvalidInput => 100,
            Self::NotFound => 101,
            Self::Conflict => 102,
            Self::Integrity => 103,
            Self::Timeout => 104,
            Self::Cancelled => 105,
            Self::RateLimited => 106,
            Self::Unavailable => 107,
            Self::Exhausted => 108,
            Self::Internal => 109,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidInput => "invalid_input",
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::Integrity => "integrity",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::RateLimited => "rate_limited",
            Self::Unavailable => "unavailable",
            Self::Exhausted => "exhausted",
            Self::Internal => "internal",
        }
    }
}

// Core internal errors
#[derive(Error, Debug)]
pub enum PampaxError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("integrity violation: {0}")]
    Integrity(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("cancelled: {0}")]
    Cancelled(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("unavailable: {0}")]
    Unavailable(String),
    #[error("exhausted: {0}")]
    Exhausted(String),
    #[error("internal error: {0}")]
    Internal(String),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("embedding API error: {0}")]
    OpenAI(#[from] async_openai::error::OpenAIError),
    #[error("task join error: {0}")]
    Join(#[from] JoinError),
}

impl PampaxError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidInput(_) => ErrorKind::InvalidInput,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::Integrity(_) => ErrorKind::Integrity,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Cancelled(_) => ErrorKind::Cancelled,
            Self::RateLimited(_) => ErrorKind::RateLimited,
            Self::Unavailable(_) => ErrorKind::Unavailable,
            Self::Exhausted(_) => ErrorKind::Exhausted,
            Self::Store(err) => match err {
                StoreError::Conflict(_) => ErrorKind::Conflict,
                StoreError::NotFound(_) => ErrorKind::NotFound,
                StoreError::Integrity(_) => ErrorKind::Integrity,
                _ => ErrorKind::Internal,
            },
            Self::Http(err) => {
                if err.is_timeout() {
                    ErrorKind::Timeout
                } else {
                    ErrorKind::Unavailable
                }
            }
            Self::Io(_) => ErrorKind::Internal,
            Self::Serde(_) | Self::OpenAI(_) | Self::Join(_) | Self::Internal(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// Process exit code for CLI bindings:
    /// 0 success, 2 config, 3 io, 4 network, 5 timeout, 6 internal.
    pub fn exit_code(&self) -> i32 {
        match self.kind() {
            ErrorKind::InvalidInput => 2,
            ErrorKind::NotFound | ErrorKind::Conflict | ErrorKind::Integrity => 3,
            ErrorKind::RateLimited | ErrorKind::Unavailable => 4,
            ErrorKind::Timeout | ErrorKind::Cancelled => 5,
            ErrorKind::Exhausted | ErrorKind::Internal => 6,
        }
    }

    /// Transient errors worth retrying at the reliability layer.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Timeout | ErrorKind::Unavailable | ErrorKind::RateLimited
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_follow_the_cli_contract() {
        assert_eq!(PampaxError::InvalidInput("bad".into()).exit_code(), 2);
        assert_eq!(PampaxError::NotFound("x".into()).exit_code(), 3);
        assert_eq!(PampaxError::Unavailable("down".into()).exit_code(), 4);
        assert_eq!(PampaxError::Timeout("slow".into()).exit_code(), 5);
        assert_eq!(PampaxError::Internal("boom".into()).exit_code(), 6);
    }

    #[test]
    fn store_errors_map_onto_their_kinds() {
        let err = PampaxError::from(StoreError::Conflict("dup".into()));
        assert_eq!(err.kind(), ErrorKind::Conflict);
        let err = PampaxError::from(StoreError::NotFound("gone".into()));
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn retryable_covers_transient_kinds_only() {
        assert!(PampaxError::Timeout("t".into()).is_retryable());
        assert!(PampaxError::RateLimited("r".into()).is_retryable());
        assert!(!PampaxError::InvalidInput("i".into()).is_retryable());
    }
}
