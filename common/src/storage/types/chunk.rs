use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, types::Value, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::{
    storage::{db::SqliteStore, parse_ts, to_ts, SearchFilter, StoreError, StoredObject},
    utils::hash::{sha256_hex, sha256_hex_parts},
};

use super::span::Span;

/// Rendered text derived from one span plus its local context. The id is
/// content-addressed: `sha256(span_id | sha256(content))`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Chunk {
    pub chunk_id: String,
    pub span_id: String,
    pub repo: String,
    pub path: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// FTS hit with its BM25-derived relevance (higher is better).
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkSearchResult {
    pub chunk: Chunk,
    pub score: f32,
}

impl StoredObject for Chunk {
    fn table_name() -> &'static str {
        "chunk"
    }

    fn get_id(&self) -> &str {
        &self.chunk_id
    }
}

impl Chunk {
    pub fn new(span: &Span, content: String) -> Self {
        let context_hash = sha256_hex(&content);
        let chunk_id = sha256_hex_parts(&[&span.span_id, &context_hash]);
        Self {
            chunk_id,
            span_id: span.span_id.clone(),
            repo: span.repo.clone(),
            path: span.path.clone(),
            content,
            created_at: Utc::now(),
        }
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let created_at: String = row.get("created_at")?;
        Ok(Self {
            chunk_id: row.get("chunk_id")?,
            span_id: row.get("span_id")?,
            repo: row.get("repo")?,
            path: row.get("path")?,
            content: row.get("content")?,
            created_at: parse_ts(&created_at)?,
        })
    }

    pub async fn upsert(&self, store: &SqliteStore) -> Result<(), StoreError> {
        let chunk = self.clone();
        store
            .with_write(move |conn| {
                conn.execute(
                    "INSERT INTO chunk (chunk_id, span_id, repo, path, content, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                     ON CONFLICT (chunk_id) DO NOTHING",
                    params![
                        chunk.chunk_id,
                        chunk.span_id,
                        chunk.repo,
                        chunk.path,
                        chunk.content,
                        to_ts(chunk.created_at),
                    ],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn bulk_upsert(chunks: Vec<Chunk>, store: &SqliteStore) -> Result<usize, StoreError> {
        let count = chunks.len();
        store
            .with_tx(move |tx| {
                for chunk in &chunks {
                    tx.execute(
                        "INSERT INTO chunk (chunk_id, span_id, repo, path, content, created_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                         ON CONFLICT (chunk_id) DO NOTHING",
                        params![
                            chunk.chunk_id,
                            chunk.span_id,
                            chunk.repo,
                            chunk.path,
                            chunk.content,
                            to_ts(chunk.created_at),
                        ],
                    )?;
                }
                Ok(count)
            })
            .await
    }

    pub async fn by_id(id: &str, store: &SqliteStore) -> Result<Option<Self>, StoreError> {
        let id = id.to_owned();
        store
            .with_conn(move |conn| {
                let chunk = conn
                    .query_row(
                        "SELECT * FROM chunk WHERE chunk_id = ?1",
                        params![id],
                        |row| Self::from_row(row),
                    )
                    .optional()?;
                Ok(chunk)
            })
            .await
    }

    /// Hydrate many chunks; missing ids are silently dropped so stale cache
    /// references degrade instead of failing.
    pub async fn by_ids(ids: Vec<String>, store: &SqliteStore) -> Result<Vec<Self>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        store
            .with_conn(move |conn| {
                let placeholders = vec!["?"; ids.len()].join(", ");
                let sql =
                    format!("SELECT * FROM chunk WHERE chunk_id IN ({placeholders})");
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(
                        params_from_iter(ids.iter().map(|id| Value::Text(id.clone()))),
                        |row| Self::from_row(row),
                    )?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    pub async fn first_for_span(
        span_id: &str,
        store: &SqliteStore,
    ) -> Result<Option<Self>, StoreError> {
        let span_id = span_id.to_owned();
        store
            .with_conn(move |conn| {
                let chunk = conn
                    .query_row(
                        "SELECT * FROM chunk WHERE span_id = ?1 ORDER BY chunk_id LIMIT 1",
                        params![span_id],
                        |row| Self::from_row(row),
                    )
                    .optional()?;
                Ok(chunk)
            })
            .await
    }

    /// Chunks without an embedding for `model`, oldest first.
    pub async fn needing_embedding(
        model: &str,
        limit: usize,
        offset: usize,
        store: &SqliteStore,
    ) -> Result<Vec<Self>, StoreError> {
        let model = model.to_owned();
        store
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT c.* FROM chunk c
                     LEFT JOIN embedding e ON e.chunk_id = c.chunk_id AND e.model = ?1
                     WHERE e.chunk_id IS NULL
                     ORDER BY c.created_at, c.chunk_id
                     LIMIT ?2 OFFSET ?3",
                )?;
                let rows = stmt
                    .query_map(params![model, limit as i64, offset as i64], |row| {
                        Self::from_row(row)
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    pub async fn delete(id: &str, store: &SqliteStore) -> Result<bool, StoreError> {
        let id = id.to_owned();
        store
            .with_write(move |conn| {
                let removed =
                    conn.execute("DELETE FROM chunk WHERE chunk_id = ?1", params![id])?;
                Ok(removed > 0)
            })
            .await
    }

    /// Porter-tokenized full-text search over `chunk_fts`, returning the
    /// top-k chunks best-first. The raw query is reduced to quoted terms
    /// joined with OR so user punctuation can never break MATCH syntax.
    pub async fn fts_search(
        query: &str,
        k: usize,
        filter: &SearchFilter,
        store: &SqliteStore,
    ) -> Result<Vec<ChunkSearchResult>, StoreError> {
        let Some(match_expr) = fts_match_expression(query) else {
            return Ok(Vec::new());
        };
        let filter = filter.clone();
        store
            .with_conn(move |conn| {
                let mut sql = String::from(
                    "SELECT c.chunk_id, c.span_id, c.repo, c.path, c.content, c.created_at,
                            bm25(chunk_fts) AS rank
                     FROM chunk_fts
                     JOIN chunk c ON c.rowid = chunk_fts.rowid",
                );
                let mut values: Vec<Value> = vec![Value::Text(match_expr)];
                let mut conditions = vec!["chunk_fts MATCH ?1".to_string()];

                if filter.language.is_some() {
                    sql.push_str(" JOIN file f ON f.repo = c.repo AND f.path = c.path");
                }
                if let Some(repo) = &filter.repo {
                    values.push(Value::Text(repo.clone()));
                    conditions.push(format!("c.repo = ?{}", values.len()));
                }
                if let Some(path_like) = filter.path_like() {
                    values.push(Value::Text(path_like));
                    conditions.push(format!("c.path LIKE ?{}", values.len()));
                }
                if let Some(lang) = &filter.language {
                    values.push(Value::Text(lang.clone()));
                    conditions.push(format!("f.lang = ?{}", values.len()));
                }

                sql.push_str(" WHERE ");
                sql.push_str(&conditions.join(" AND "));
                values.push(Value::Integer(k as i64));
                sql.push_str(&format!(" ORDER BY rank LIMIT ?{}", values.len()));

                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(params_from_iter(values), |row| {
                        let chunk = Self::from_row(row)?;
                        let rank: f64 = row.get("rank")?;
                        Ok(ChunkSearchResult {
                            chunk,
                            // bm25() is negative, more negative = better.
                            score: (-rank) as f32,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    /// Verify the FTS index against its external content table. Surfaced
    /// by the health report; `false` means the mirror triggers diverged.
    pub async fn fts_integrity(store: &SqliteStore) -> Result<bool, StoreError> {
        store
            .with_conn(|conn| {
                let checked = conn.execute(
                    "INSERT INTO chunk_fts (chunk_fts, rank) VALUES ('integrity-check', 1)",
                    [],
                );
                Ok(checked.is_ok())
            })
            .await
    }
}

/// Build an FTS5 MATCH expression from free text: quoted terms OR-ed
/// together. Returns `None` when no searchable term survives.
pub fn fts_match_expression(query: &str) -> Option<String> {
    let terms: Vec<String> = query
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{t}\""))
        .collect();
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" OR "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::types::span::{NewSpan, SpanKind};

    async fn seeded_store() -> (SqliteStore, Span) {
        let store = SqliteStore::in_memory().expect("store");
        let span = Span::new(NewSpan {
            repo: "demo",
            path: "src/user.py",
            byte_start: 0,
            byte_end: 100,
            kind: Some(SpanKind::Function),
            name: Some("get_user_by_id"),
            signature: Some("def get_user_by_id(id):"),
            doc: None,
            parents: Vec::new(),
        })
        .expect("span");
        span.upsert(&store).await.expect("span upsert");
        (store, span)
    }

    #[test]
    fn match_expression_survives_punctuation() {
        assert_eq!(
            fts_match_expression("user-service: lookup!").as_deref(),
            Some("\"user\" OR \"service\" OR \"lookup\"")
        );
        assert!(fts_match_expression("  ...  ").is_none());
    }

    #[tokio::test]
    async fn chunk_ids_are_content_addressed() {
        let (_, span) = seeded_store().await;
        let a = Chunk::new(&span, "def get_user_by_id(id): ...".to_string());
        let b = Chunk::new(&span, "def get_user_by_id(id): ...".to_string());
        let c = Chunk::new(&span, "something else".to_string());
        assert_eq!(a.chunk_id, b.chunk_id);
        assert_ne!(a.chunk_id, c.chunk_id);
    }

    #[tokio::test]
    async fn fts_row_follows_chunk_within_the_same_transaction_boundary() {
        let (store, span) = seeded_store().await;
        let chunk = Chunk::new(&span, "retrieves a user record by identifier".to_string());
        chunk.upsert(&store).await.expect("chunk upsert");

        let hits = Chunk::fts_search("user identifier", 5, &SearchFilter::default(), &store)
            .await
            .expect("fts search");
        assert_eq!(hits.len(), 1);
        assert_eq!(
            hits.first().map(|h| h.chunk.chunk_id.as_str()),
            Some(chunk.chunk_id.as_str())
        );

        Chunk::delete(&chunk.chunk_id, &store).await.expect("delete");
        let hits = Chunk::fts_search("user identifier", 5, &SearchFilter::default(), &store)
            .await
            .expect("fts search after delete");
        assert!(hits.is_empty(), "delete trigger must remove the FTS row");
        assert!(
            Chunk::fts_integrity(&store).await.expect("integrity"),
            "index must stay consistent with the content table"
        );
    }

    #[tokio::test]
    async fn porter_stemming_matches_inflected_terms() {
        let (store, span) = seeded_store().await;
        let chunk = Chunk::new(&span, "handles user lookups efficiently".to_string());
        chunk.upsert(&store).await.expect("chunk upsert");

        let hits = Chunk::fts_search("lookup", 5, &SearchFilter::default(), &store)
            .await
            .expect("fts search");
        assert_eq!(hits.len(), 1, "porter tokenizer should stem lookups -> lookup");
    }

    #[tokio::test]
    async fn deleting_a_span_cascades_to_chunks() {
        let (store, span) = seeded_store().await;
        let chunk = Chunk::new(&span, "body".to_string());
        chunk.upsert(&store).await.expect("chunk upsert");

        let span_id = span.span_id.clone();
        store
            .with_write(move |conn| {
                conn.execute("DELETE FROM span WHERE span_id = ?1", params![span_id])?;
                Ok(())
            })
            .await
            .expect("delete span");

        let gone = Chunk::by_id(&chunk.chunk_id, &store).await.expect("by_id");
        assert!(gone.is_none(), "chunk must cascade with its span");
    }

    #[tokio::test]
    async fn needing_embedding_reports_unembedded_chunks() {
        let (store, span) = seeded_store().await;
        let chunk = Chunk::new(&span, "unembedded body".to_string());
        chunk.upsert(&store).await.expect("chunk upsert");

        let pending = Chunk::needing_embedding("bge-small", 10, 0, &store)
            .await
            .expect("needing_embedding");
        assert_eq!(pending.len(), 1);
    }
}
