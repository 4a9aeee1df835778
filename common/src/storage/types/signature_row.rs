use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::storage::{db::SqliteStore, parse_ts, to_ts, StoreError};

/// Persisted signature-cache entry: a query signature that resolved to a
/// high-satisfaction bundle, replayable until its TTL lapses.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SignatureRow {
    pub query_signature: String,
    pub bundle_id: String,
    /// JSON snapshot of the bundle served on a hit.
    pub bundle: String,
    pub satisfaction: f32,
    pub usage_count: i64,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl SignatureRow {
    pub fn new(
        query_signature: &str,
        bundle_id: &str,
        bundle_json: String,
        satisfaction: f32,
        ttl_days: i64,
    ) -> Self {
        let now = Utc::now();
        Self {
            query_signature: query_signature.to_owned(),
            bundle_id: bundle_id.to_owned(),
            bundle: bundle_json,
            satisfaction,
            usage_count: 0,
            created_at: now,
            last_used_at: now,
            expires_at: now + Duration::days(ttl_days),
        }
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let created_at: String = row.get("created_at")?;
        let last_used_at: String = row.get("last_used_at")?;
        let expires_at: String = row.get("expires_at")?;
        Ok(Self {
            query_signature: row.get("query_signature")?,
            bundle_id: row.get("bundle_id")?,
            bundle: row.get("bundle")?,
            satisfaction: row.get::<_, f64>("satisfaction")? as f32,
            usage_count: row.get("usage_count")?,
            created_at: parse_ts(&created_at)?,
            last_used_at: parse_ts(&last_used_at)?,
            expires_at: parse_ts(&expires_at)?,
        })
    }

    pub async fn put(&self, store: &SqliteStore) -> Result<(), StoreError> {
        let row = self.clone();
        store
            .with_write(move |conn| {
                conn.execute(
                    "INSERT INTO signature_cache
                         (query_signature, bundle_id, bundle, satisfaction, usage_count,
                          created_at, last_used_at, expires_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                     ON CONFLICT (query_signature) DO UPDATE SET
                         bundle_id = excluded.bundle_id,
                         bundle = excluded.bundle,
                         satisfaction = excluded.satisfaction,
                         last_used_at = excluded.last_used_at,
                         expires_at = excluded.expires_at",
                    params![
                        row.query_signature,
                        row.bundle_id,
                        row.bundle,
                        f64::from(row.satisfaction),
                        row.usage_count,
                        to_ts(row.created_at),
                        to_ts(row.last_used_at),
                        to_ts(row.expires_at),
                    ],
                )?;
                Ok(())
            })
            .await
    }

    /// Unexpired entry for the signature, bumping usage on the way out.
    pub async fn take_valid(
        query_signature: &str,
        store: &SqliteStore,
    ) -> Result<Option<Self>, StoreError> {
        let signature = query_signature.to_owned();
        store
            .with_write(move |conn| {
                let now = to_ts(Utc::now());
                let row = conn
                    .query_row(
                        "SELECT * FROM signature_cache
                         WHERE query_signature = ?1 AND expires_at > ?2",
                        params![signature, now],
                        |row| Self::from_row(row),
                    )
                    .optional()?;
                if row.is_some() {
                    conn.execute(
                        "UPDATE signature_cache
                         SET usage_count = usage_count + 1, last_used_at = ?2
                         WHERE query_signature = ?1",
                        params![signature, now],
                    )?;
                }
                Ok(row)
            })
            .await
    }

    /// Evict least-recently-used rows beyond `max_size`, plus anything
    /// expired. Returns the number removed.
    pub async fn prune(max_size: usize, store: &SqliteStore) -> Result<usize, StoreError> {
        store
            .with_write(move |conn| {
                let now = to_ts(Utc::now());
                let expired =
                    conn.execute("DELETE FROM signature_cache WHERE expires_at <= ?1", params![now])?;
                let over = conn.execute(
                    "DELETE FROM signature_cache WHERE query_signature IN (
                         SELECT query_signature FROM signature_cache
                         ORDER BY last_used_at DESC
                         LIMIT -1 OFFSET ?1
                     )",
                    params![max_size as i64],
                )?;
                Ok(expired + over)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hits_bump_usage_and_expired_rows_are_skipped() {
        let store = SqliteStore::in_memory().expect("store");
        SignatureRow::new("sig-1", "bundle-1", "{}".to_string(), 0.9, 7)
            .put(&store)
            .await
            .expect("put");

        let hit = SignatureRow::take_valid("sig-1", &store)
            .await
            .expect("take")
            .expect("present");
        assert_eq!(hit.bundle_id, "bundle-1");

        let again = SignatureRow::take_valid("sig-1", &store)
            .await
            .expect("take")
            .expect("present");
        assert_eq!(again.usage_count, 1, "usage counted from the first hit");

        let mut stale = SignatureRow::new("sig-2", "bundle-2", "{}".to_string(), 0.95, 7);
        stale.expires_at = Utc::now() - Duration::hours(1);
        stale.put(&store).await.expect("put stale");
        assert!(SignatureRow::take_valid("sig-2", &store)
            .await
            .expect("take")
            .is_none());
    }

    #[tokio::test]
    async fn prune_keeps_the_most_recently_used() {
        let store = SqliteStore::in_memory().expect("store");
        for i in 0..5 {
            SignatureRow::new(&format!("sig-{i}"), "b", "{}".to_string(), 0.9, 7)
                .put(&store)
                .await
                .expect("put");
        }
        let _ = SignatureRow::take_valid("sig-4", &store).await.expect("take");

        let removed = SignatureRow::prune(2, &store).await.expect("prune");
        assert_eq!(removed, 3);
        assert!(SignatureRow::take_valid("sig-4", &store)
            .await
            .expect("take")
            .is_some());
    }
}
