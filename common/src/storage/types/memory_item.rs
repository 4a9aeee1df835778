use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::storage::{db::SqliteStore, parse_ts, to_ts, StoreError, StoredObject};

/// User-pinned fact or note attached to a session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemoryItem {
    pub id: String,
    pub session_id: String,
    pub kind: String,
    pub key: Option<String>,
    pub content: String,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub pinned: bool,
}

/// Selection criteria for `RememberQuery` / `Forget`.
#[derive(Debug, Clone, Default)]
pub struct MemoryFilter {
    pub session_id: Option<String>,
    pub kind: Option<String>,
    pub key: Option<String>,
    pub pinned_only: bool,
}

impl StoredObject for MemoryItem {
    fn table_name() -> &'static str {
        "memory_items"
    }

    fn get_id(&self) -> &str {
        &self.id
    }
}

impl MemoryItem {
    pub fn new(session_id: &str, kind: &str, content: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_owned(),
            kind: kind.to_owned(),
            key: None,
            content: content.to_owned(),
            metadata: serde_json::Value::Null,
            created_at: Utc::now(),
            expires_at: None,
            pinned: false,
        }
    }

    pub fn with_key(mut self, key: &str) -> Self {
        self.key = Some(key.to_owned());
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn pinned(mut self) -> Self {
        self.pinned = true;
        self
    }

    pub fn expiring_at(mut self, at: DateTime<Utc>) -> Self {
        self.expires_at = Some(at);
        self
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let metadata: Option<String> = row.get("metadata")?;
        let created_at: String = row.get("created_at")?;
        let expires_at: Option<String> = row.get("expires_at")?;
        Ok(Self {
            id: row.get("id")?,
            session_id: row.get("session_id")?,
            kind: row.get("kind")?,
            key: row.get("key")?,
            content: row.get("content")?,
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
                })?
                .unwrap_or(serde_json::Value::Null),
            created_at: parse_ts(&created_at)?,
            expires_at: expires_at.as_deref().map(parse_ts).transpose()?,
            pinned: row.get::<_, i64>("pinned")? != 0,
        })
    }

    pub async fn upsert(&self, store: &SqliteStore) -> Result<(), StoreError> {
        let item = self.clone();
        store
            .with_write(move |conn| {
                let metadata = if item.metadata.is_null() {
                    None
                } else {
                    Some(
                        serde_json::to_string(&item.metadata)
                            .map_err(|e| StoreError::Integrity(e.to_string()))?,
                    )
                };
                conn.execute(
                    "INSERT INTO memory_items
                         (id, session_id, kind, key, content, metadata, created_at,
                          expires_at, pinned)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                     ON CONFLICT (id) DO UPDATE SET
                         kind = excluded.kind,
                         key = excluded.key,
                         content = excluded.content,
                         metadata = excluded.metadata,
                         expires_at = excluded.expires_at,
                         pinned = excluded.pinned",
                    params![
                        item.id,
                        item.session_id,
                        item.kind,
                        item.key,
                        item.content,
                        metadata,
                        to_ts(item.created_at),
                        item.expires_at.map(to_ts),
                        i64::from(item.pinned),
                    ],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn by_id(id: &str, store: &SqliteStore) -> Result<Option<Self>, StoreError> {
        let id = id.to_owned();
        store
            .with_conn(move |conn| {
                let item = conn
                    .query_row(
                        "SELECT * FROM memory_items WHERE id = ?1",
                        params![id],
                        |row| Self::from_row(row),
                    )
                    .optional()?;
                Ok(item)
            })
            .await
    }

    /// Fetch items matching the filter, unexpired first-created-first.
    pub async fn query(
        filter: MemoryFilter,
        store: &SqliteStore,
    ) -> Result<Vec<Self>, StoreError> {
        store
            .with_conn(move |conn| {
                let mut sql = String::from(
                    "SELECT * FROM memory_items
                     WHERE (expires_at IS NULL OR expires_at > ?1)",
                );
                let mut values: Vec<rusqlite::types::Value> =
                    vec![rusqlite::types::Value::Text(to_ts(Utc::now()))];

                if let Some(session_id) = &filter.session_id {
                    values.push(rusqlite::types::Value::Text(session_id.clone()));
                    sql.push_str(&format!(" AND session_id = ?{}", values.len()));
                }
                if let Some(kind) = &filter.kind {
                    values.push(rusqlite::types::Value::Text(kind.clone()));
                    sql.push_str(&format!(" AND kind = ?{}", values.len()));
                }
                if let Some(key) = &filter.key {
                    values.push(rusqlite::types::Value::Text(key.clone()));
                    sql.push_str(&format!(" AND key = ?{}", values.len()));
                }
                if filter.pinned_only {
                    sql.push_str(" AND pinned = 1");
                }
                sql.push_str(" ORDER BY created_at");

                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(rusqlite::params_from_iter(values), |row| {
                        Self::from_row(row)
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    /// Delete matching items, returning how many were removed.
    pub async fn forget(filter: MemoryFilter, store: &SqliteStore) -> Result<usize, StoreError> {
        store
            .with_write(move |conn| {
                let mut sql = String::from("DELETE FROM memory_items WHERE 1 = 1");
                let mut values: Vec<rusqlite::types::Value> = Vec::new();

                if let Some(session_id) = &filter.session_id {
                    values.push(rusqlite::types::Value::Text(session_id.clone()));
                    sql.push_str(&format!(" AND session_id = ?{}", values.len()));
                }
                if let Some(kind) = &filter.kind {
                    values.push(rusqlite::types::Value::Text(kind.clone()));
                    sql.push_str(&format!(" AND kind = ?{}", values.len()));
                }
                if let Some(key) = &filter.key {
                    values.push(rusqlite::types::Value::Text(key.clone()));
                    sql.push_str(&format!(" AND key = ?{}", values.len()));
                }
                if filter.pinned_only {
                    sql.push_str(" AND pinned = 1");
                }

                let removed = conn.execute(&sql, rusqlite::params_from_iter(values))?;
                Ok(removed)
            })
            .await
    }

    pub async fn delete(id: &str, store: &SqliteStore) -> Result<bool, StoreError> {
        let id = id.to_owned();
        store
            .with_write(move |conn| {
                let removed =
                    conn.execute("DELETE FROM memory_items WHERE id = ?1", params![id])?;
                Ok(removed > 0)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::types::session::Session;

    #[tokio::test]
    async fn memory_crud_respects_session_and_pin_filters() {
        let store = SqliteStore::in_memory().expect("store");
        Session::ensure("s1", &store).await.expect("session");
        Session::ensure("s2", &store).await.expect("session");

        MemoryItem::new("s1", "note", "prefer async stores")
            .pinned()
            .upsert(&store)
            .await
            .expect("pinned note");
        MemoryItem::new("s1", "note", "scratch thought")
            .upsert(&store)
            .await
            .expect("note");
        MemoryItem::new("s2", "note", "other session")
            .upsert(&store)
            .await
            .expect("other note");

        let session_items = MemoryItem::query(
            MemoryFilter {
                session_id: Some("s1".to_string()),
                ..MemoryFilter::default()
            },
            &store,
        )
        .await
        .expect("query");
        assert_eq!(session_items.len(), 2);

        let pinned = MemoryItem::query(
            MemoryFilter {
                session_id: Some("s1".to_string()),
                pinned_only: true,
                ..MemoryFilter::default()
            },
            &store,
        )
        .await
        .expect("pinned query");
        assert_eq!(pinned.len(), 1);
        assert!(pinned[0].content.contains("async"));

        let removed = MemoryItem::forget(
            MemoryFilter {
                session_id: Some("s1".to_string()),
                ..MemoryFilter::default()
            },
            &store,
        )
        .await
        .expect("forget");
        assert_eq!(removed, 2);
    }

    #[tokio::test]
    async fn expired_items_are_invisible_to_query() {
        let store = SqliteStore::in_memory().expect("store");
        Session::ensure("s1", &store).await.expect("session");

        MemoryItem::new("s1", "note", "stale")
            .expiring_at(Utc::now() - chrono::Duration::hours(1))
            .upsert(&store)
            .await
            .expect("expired note");

        let visible = MemoryItem::query(
            MemoryFilter {
                session_id: Some("s1".to_string()),
                ..MemoryFilter::default()
            },
            &store,
        )
        .await
        .expect("query");
        assert!(visible.is_empty());
    }
}
