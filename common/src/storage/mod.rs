pub mod db;
pub mod migrations;
pub mod types;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::task::JoinError;

/// Typed store failures. `Backend` wraps the raw driver error; constraint
/// violations are lifted into `Conflict`/`Integrity` so callers never
/// match on SQLite codes.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("integrity: {0}")]
    Integrity(String),
    #[error("backend: {0}")]
    Backend(rusqlite::Error),
    #[error("pool: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("task join: {0}")]
    Join(#[from] JoinError),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(code, _) => match code.code {
                rusqlite::ErrorCode::ConstraintViolation => {
                    if code.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                        || code.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
                    {
                        Self::Conflict(err.to_string())
                    } else {
                        Self::Integrity(err.to_string())
                    }
                }
                _ => Self::Backend(err),
            },
            rusqlite::Error::QueryReturnedNoRows => Self::NotFound("row not found".to_string()),
            _ => Self::Backend(err),
        }
    }
}

pub trait StoredObject {
    fn table_name() -> &'static str;
    fn get_id(&self) -> &str;
}

/// Repo / path / language constraints shared by the FTS and ANN search
/// paths. `path_glob` accepts `*` and `?` wildcards.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchFilter {
    pub repo: Option<String>,
    pub path_glob: Option<String>,
    pub language: Option<String>,
}

impl SearchFilter {
    pub fn is_empty(&self) -> bool {
        self.repo.is_none() && self.path_glob.is_none() && self.language.is_none()
    }

    /// Translate the glob into a SQL LIKE pattern.
    pub fn path_like(&self) -> Option<String> {
        self.path_glob
            .as_ref()
            .map(|glob| glob.replace('*', "%").replace('?', "_"))
    }
}

/// Timestamps are persisted as RFC 3339 TEXT.
pub(crate) fn to_ts(value: DateTime<Utc>) -> String {
    value.to_rfc3339()
}

pub(crate) fn parse_ts(value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_glob_translates_to_like() {
        let filter = SearchFilter {
            path_glob: Some("src/*.rs".to_string()),
            ..SearchFilter::default()
        };
        assert_eq!(filter.path_like().as_deref(), Some("src/%.rs"));
    }

    #[test]
    fn timestamps_round_trip() {
        let now = Utc::now();
        let parsed = parse_ts(&to_ts(now)).expect("parse own output");
        assert_eq!(parsed.timestamp_micros(), now.timestamp_micros());
    }
}
