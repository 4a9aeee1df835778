use chrono::{DateTime, Utc};
use rusqlite::{params, Row};
use serde::{Deserialize, Serialize};

use crate::storage::{db::SqliteStore, parse_ts, to_ts, StoreError};

/// Connects a pinned memory to a span, as created by `PinSpan`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemoryLink {
    pub memory_id: String,
    pub span_id: String,
    pub label: Option<String>,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl MemoryLink {
    pub fn new(memory_id: &str, span_id: &str, label: Option<&str>, note: Option<&str>) -> Self {
        Self {
            memory_id: memory_id.to_owned(),
            span_id: span_id.to_owned(),
            label: label.map(str::to_owned),
            note: note.map(str::to_owned),
            created_at: Utc::now(),
        }
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let created_at: String = row.get("created_at")?;
        Ok(Self {
            memory_id: row.get("memory_id")?,
            span_id: row.get("span_id")?,
            label: row.get("label")?,
            note: row.get("note")?,
            created_at: parse_ts(&created_at)?,
        })
    }

    pub async fn insert(&self, store: &SqliteStore) -> Result<(), StoreError> {
        let link = self.clone();
        store
            .with_write(move |conn| {
                conn.execute(
                    "INSERT INTO memory_links (memory_id, span_id, label, note, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT (memory_id, span_id) DO UPDATE SET
                         label = excluded.label,
                         note = excluded.note",
                    params![
                        link.memory_id,
                        link.span_id,
                        link.label,
                        link.note,
                        to_ts(link.created_at),
                    ],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn for_span(span_id: &str, store: &SqliteStore) -> Result<Vec<Self>, StoreError> {
        let span_id = span_id.to_owned();
        store
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT * FROM memory_links WHERE span_id = ?1 ORDER BY created_at",
                )?;
                let rows = stmt
                    .query_map(params![span_id], |row| Self::from_row(row))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::types::{memory_item::MemoryItem, session::Session};

    #[tokio::test]
    async fn links_cascade_with_their_memory() {
        let store = SqliteStore::in_memory().expect("store");
        Session::ensure("s1", &store).await.expect("session");
        let memory = MemoryItem::new("s1", "pin", "important span");
        memory.upsert(&store).await.expect("memory");

        MemoryLink::new(&memory.id, "span-1", Some("hotspot"), None)
            .insert(&store)
            .await
            .expect("link");
        assert_eq!(
            MemoryLink::for_span("span-1", &store).await.expect("links").len(),
            1
        );

        MemoryItem::delete(&memory.id, &store).await.expect("delete");
        assert!(MemoryLink::for_span("span-1", &store)
            .await
            .expect("links")
            .is_empty());
    }
}
