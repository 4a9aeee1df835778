use chrono::Utc;
use rusqlite::params;

use crate::storage::{db::SqliteStore, to_ts, StoreError};

/// Append-only operational log of search/assemble calls. Write failures
/// here are recoverable and never fail the query path.
pub struct SearchLog;

impl SearchLog {
    pub async fn append(
        query: &str,
        intent: &str,
        duration_ms: u64,
        result_count: usize,
        store: &SqliteStore,
    ) -> Result<(), StoreError> {
        let query = query.to_owned();
        let intent = intent.to_owned();
        store
            .with_write(move |conn| {
                conn.execute(
                    "INSERT INTO search_log (query, intent, duration_ms, result_count, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        query,
                        intent,
                        duration_ms as i64,
                        result_count as i64,
                        to_ts(Utc::now()),
                    ],
                )?;
                Ok(())
            })
            .await
    }
}
