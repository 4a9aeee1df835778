use chrono::Utc;
use rusqlite::params;

use crate::storage::{db::SqliteStore, to_ts, StoreError};

/// Terminal states for a background job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Completed,
    Failed,
}

impl JobStatus {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// Bookkeeping for offline batches (learn runs, store maintenance).
pub struct JobRun;

impl JobRun {
    pub async fn start(kind: &str, store: &SqliteStore) -> Result<i64, StoreError> {
        let kind = kind.to_owned();
        store
            .with_write(move |conn| {
                conn.execute(
                    "INSERT INTO job_run (kind, status, started_at)
                     VALUES (?1, 'running', ?2)",
                    params![kind, to_ts(Utc::now())],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await
    }

    pub async fn finish(
        id: i64,
        status: JobStatus,
        error: Option<&str>,
        store: &SqliteStore,
    ) -> Result<(), StoreError> {
        let error = error.map(str::to_owned);
        store
            .with_write(move |conn| {
                let updated = conn.execute(
                    "UPDATE job_run SET status = ?2, error = ?3, finished_at = ?4
                     WHERE id = ?1",
                    params![id, status.as_str(), error, to_ts(Utc::now())],
                )?;
                if updated == 0 {
                    return Err(StoreError::NotFound(format!("job_run {id}")));
                }
                Ok(())
            })
            .await
    }
}
