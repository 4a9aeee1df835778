use std::{
    path::Path,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, OpenFlags, Transaction};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{migrations, StoreError};

/// Pooled SQLite store behind an async facade.
///
/// Readers run concurrently on pooled connections; writers serialize on an
/// internal lock so bulk transactions never interleave. All SQL executes on
/// the blocking thread pool. Every successful write bumps a generation
/// counter that in-memory caches use to detect re-indexing.
#[derive(Clone)]
pub struct SqliteStore {
    pool: Pool<SqliteConnectionManager>,
    write_lock: Arc<Mutex<()>>,
    generation: Arc<AtomicU64>,
}

fn configure(conn: &mut Connection) -> Result<(), rusqlite::Error> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.pragma_update(None, "mmap_size", 268_435_456_i64)?;
    conn.pragma_update(None, "cache_size", 10_000_i64)?;
    conn.busy_timeout(std::time::Duration::from_secs(5))?;
    Ok(())
}

impl SqliteStore {
    /// Open (creating if needed) the store at `path` and bring the schema
    /// up to date.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Integrity(format!("creating store dir: {e}")))?;
            }
        }
        let manager = SqliteConnectionManager::file(path).with_init(configure);
        Self::build(manager)
    }

    /// Ephemeral store for tests and dry runs. Uses a shared-cache URI so
    /// every pooled connection sees the same in-memory database.
    pub fn in_memory() -> Result<Self, StoreError> {
        let uri = format!("file:pampax-mem-{}?mode=memory&cache=shared", Uuid::new_v4());
        let manager = SqliteConnectionManager::file(uri)
            .with_flags(
                OpenFlags::SQLITE_OPEN_READ_WRITE
                    | OpenFlags::SQLITE_OPEN_CREATE
                    | OpenFlags::SQLITE_OPEN_URI,
            )
            .with_init(configure);
        Self::build(manager)
    }

    fn build(manager: SqliteConnectionManager) -> Result<Self, StoreError> {
        let pool = Pool::builder()
            .max_size(8)
            .min_idle(Some(1))
            .build(manager)?;

        {
            let mut conn = pool.get()?;
            migrations::apply_migrations(&mut conn)?;
        }

        Ok(Self {
            pool,
            write_lock: Arc::new(Mutex::new(())),
            generation: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Monotonic counter bumped on every successful write. Caches compare
    /// it to invalidate entries after re-indexing.
    pub fn write_generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Run a read-only operation on a pooled connection.
    pub async fn with_conn<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            op(&conn)
        })
        .await?
    }

    /// Run a write operation. Writers are serialized; a successful write
    /// bumps the generation counter.
    pub async fn with_write<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let _guard = self.write_lock.lock().await;
        let pool = self.pool.clone();
        let out = tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            op(&conn)
        })
        .await??;
        self.generation.fetch_add(1, Ordering::AcqRel);
        Ok(out)
    }

    /// Run a bulk write inside a single transaction. Readers never observe
    /// a partially committed batch.
    pub async fn with_tx<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let _guard = self.write_lock.lock().await;
        let pool = self.pool.clone();
        let out = tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            let tx = conn.transaction()?;
            let out = op(&tx)?;
            tx.commit()?;
            Ok::<T, StoreError>(out)
        })
        .await??;
        self.generation.fetch_add(1, Ordering::AcqRel);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_store_migrates_and_shares_state() {
        let store = SqliteStore::in_memory().expect("open in-memory store");

        let tables: Vec<String> = store
            .with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name",
                )?;
                let rows = stmt
                    .query_map([], |row| row.get::<_, String>(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
            .expect("list tables");

        for required in [
            "file",
            "span",
            "chunk",
            "embedding",
            "reference",
            "job_run",
            "rerank_cache",
            "search_log",
            "memory_items",
            "sessions",
            "interactions",
            "memory_links",
            "packing_profile",
            "schema_migrations",
            "signature_cache",
        ] {
            assert!(tables.iter().any(|t| t == required), "missing {required}");
        }
    }

    #[tokio::test]
    async fn writes_bump_the_generation_counter() {
        let store = SqliteStore::in_memory().expect("open store");
        let before = store.write_generation();

        store
            .with_write(|conn| {
                conn.execute(
                    "INSERT INTO sessions (session_id, created_at, last_active_at)
                     VALUES ('s1', '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z')",
                    [],
                )?;
                Ok(())
            })
            .await
            .expect("insert session");

        assert!(store.write_generation() > before);
    }

    #[tokio::test]
    async fn transactions_are_atomic() {
        let store = SqliteStore::in_memory().expect("open store");

        let result = store
            .with_tx(|tx| {
                tx.execute(
                    "INSERT INTO sessions (session_id, created_at, last_active_at)
                     VALUES ('tx1', '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z')",
                    [],
                )?;
                Err::<(), _>(StoreError::Integrity("forced rollback".to_string()))
            })
            .await;
        assert!(result.is_err());

        let count: i64 = store
            .with_conn(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM sessions", [], |row| row.get(0))?)
            })
            .await
            .expect("count sessions");
        assert_eq!(count, 0, "rolled-back insert must not be visible");
    }
}
