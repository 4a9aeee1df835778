use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::storage::{db::SqliteStore, parse_ts, to_ts, StoreError};

/// Groups interactions and memories under one caller-supplied id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Session {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    pub metadata: Option<serde_json::Value>,
}

impl Session {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let created_at: String = row.get("created_at")?;
        let last_active_at: String = row.get("last_active_at")?;
        let metadata: Option<String> = row.get("metadata")?;
        Ok(Self {
            session_id: row.get("session_id")?,
            created_at: parse_ts(&created_at)?,
            last_active_at: parse_ts(&last_active_at)?,
            metadata: metadata
                .as_deref()
                .map(serde_json::from_str)
                .transpose()
                .map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(
                        0,
                        rusqlite::types::Type::Text,
                        Box::new(e),
                    )
                })?,
        })
    }

    /// Create the session if missing and refresh its activity timestamp.
    pub async fn ensure(session_id: &str, store: &SqliteStore) -> Result<(), StoreError> {
        let session_id = session_id.to_owned();
        store
            .with_write(move |conn| {
                let now = to_ts(Utc::now());
                conn.execute(
                    "INSERT INTO sessions (session_id, created_at, last_active_at)
                     VALUES (?1, ?2, ?2)
                     ON CONFLICT (session_id) DO UPDATE SET last_active_at = excluded.last_active_at",
                    params![session_id, now],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn get(session_id: &str, store: &SqliteStore) -> Result<Option<Self>, StoreError> {
        let session_id = session_id.to_owned();
        store
            .with_conn(move |conn| {
                let session = conn
                    .query_row(
                        "SELECT * FROM sessions WHERE session_id = ?1",
                        params![session_id],
                        |row| Self::from_row(row),
                    )
                    .optional()?;
                Ok(session)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ensure_is_idempotent() {
        let store = SqliteStore::in_memory().expect("store");
        Session::ensure("abc", &store).await.expect("first ensure");
        Session::ensure("abc", &store).await.expect("second ensure");

        let session = Session::get("abc", &store)
            .await
            .expect("get")
            .expect("present");
        assert_eq!(session.session_id, "abc");
    }
}
