use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::storage::{db::SqliteStore, to_ts, StoreError};

/// Cached reranker output keyed by
/// `sha256(provider | model | query | sorted(doc_ids))`. Because chunk ids
/// are content-addressed, any chunk edit changes the key, so entries
/// self-invalidate on re-indexing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RerankCacheRow {
    pub cache_key: String,
    pub provider: String,
    pub model: Option<String>,
    /// JSON array of `{doc_ref, score}` pairs in final order.
    pub ranking: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl RerankCacheRow {
    pub fn new(
        cache_key: &str,
        provider: &str,
        model: Option<&str>,
        ranking_json: String,
        ttl_hours: i64,
    ) -> Self {
        let now = Utc::now();
        Self {
            cache_key: cache_key.to_owned(),
            provider: provider.to_owned(),
            model: model.map(str::to_owned),
            ranking: ranking_json,
            created_at: now,
            expires_at: now + Duration::hours(ttl_hours),
        }
    }

    pub async fn put(&self, store: &SqliteStore) -> Result<(), StoreError> {
        let row = self.clone();
        store
            .with_write(move |conn| {
                conn.execute(
                    "INSERT INTO rerank_cache
                         (cache_key, provider, model, ranking, created_at, expires_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                     ON CONFLICT (cache_key) DO UPDATE SET
                         ranking = excluded.ranking,
                         created_at = excluded.created_at,
                         expires_at = excluded.expires_at",
                    params![
                        row.cache_key,
                        row.provider,
                        row.model,
                        row.ranking,
                        to_ts(row.created_at),
                        to_ts(row.expires_at),
                    ],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn get_valid(
        cache_key: &str,
        store: &SqliteStore,
    ) -> Result<Option<String>, StoreError> {
        let cache_key = cache_key.to_owned();
        store
            .with_conn(move |conn| {
                let ranking = conn
                    .query_row(
                        "SELECT ranking FROM rerank_cache
                         WHERE cache_key = ?1 AND expires_at > ?2",
                        params![cache_key, to_ts(Utc::now())],
                        |row| row.get::<_, String>(0),
                    )
                    .optional()?;
                Ok(ranking)
            })
            .await
    }

    pub async fn purge_expired(store: &SqliteStore) -> Result<usize, StoreError> {
        store
            .with_write(move |conn| {
                let removed = conn.execute(
                    "DELETE FROM rerank_cache WHERE expires_at <= ?1",
                    params![to_ts(Utc::now())],
                )?;
                Ok(removed)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn valid_entries_return_bit_identical_payloads() {
        let store = SqliteStore::in_memory().expect("store");
        let payload = r#"[{"doc_ref":"c1","score":0.9},{"doc_ref":"c2","score":0.4}]"#;
        RerankCacheRow::new("key-1", "mock", Some("m"), payload.to_string(), 24)
            .put(&store)
            .await
            .expect("put");

        let first = RerankCacheRow::get_valid("key-1", &store).await.expect("get");
        let second = RerankCacheRow::get_valid("key-1", &store).await.expect("get");
        assert_eq!(first.as_deref(), Some(payload));
        assert_eq!(first, second, "cache hits must be bit-identical");
    }

    #[tokio::test]
    async fn expired_entries_are_purged() {
        let store = SqliteStore::in_memory().expect("store");
        let mut row = RerankCacheRow::new("key-2", "mock", None, "[]".to_string(), 24);
        row.expires_at = Utc::now() - Duration::minutes(1);
        row.put(&store).await.expect("put");

        assert!(RerankCacheRow::get_valid("key-2", &store)
            .await
            .expect("get")
            .is_none());
        assert_eq!(RerankCacheRow::purge_expired(&store).await.expect("purge"), 1);
    }
}
