use chrono::{DateTime, Utc};
use rusqlite::{params, types::Value, params_from_iter, Row};
use serde::{Deserialize, Serialize};

use crate::storage::{db::SqliteStore, parse_ts, to_ts, SearchFilter, StoreError};

/// One stored vector for a `(chunk, model)` pair. Vectors are persisted as
/// little-endian f32 blobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkEmbedding {
    pub chunk_id: String,
    pub model: String,
    pub dim: usize,
    pub vector: Vec<f32>,
    pub created_at: DateTime<Utc>,
}

/// ANN hit, similarity in [-1, 1] (cosine).
#[derive(Debug, Clone, PartialEq)]
pub struct AnnHit {
    pub chunk_id: String,
    pub score: f32,
}

pub fn encode_vector(vector: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(vector.len() * 4);
    for value in vector {
        out.extend_from_slice(&value.to_le_bytes());
    }
    out
}

pub fn decode_vector(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|bytes| f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
        .collect()
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom <= f32::EPSILON {
        0.0
    } else {
        dot / denom
    }
}

impl ChunkEmbedding {
    pub fn new(chunk_id: &str, model: &str, vector: Vec<f32>) -> Self {
        Self {
            chunk_id: chunk_id.to_owned(),
            model: model.to_owned(),
            dim: vector.len(),
            vector,
            created_at: Utc::now(),
        }
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let blob: Vec<u8> = row.get("vector")?;
        let created_at: String = row.get("created_at")?;
        Ok(Self {
            chunk_id: row.get("chunk_id")?,
            model: row.get("model")?,
            dim: row.get::<_, i64>("dim")? as usize,
            vector: decode_vector(&blob),
            created_at: parse_ts(&created_at)?,
        })
    }

    pub async fn upsert(&self, store: &SqliteStore) -> Result<(), StoreError> {
        let embedding = self.clone();
        store
            .with_write(move |conn| {
                conn.execute(
                    "INSERT INTO embedding (chunk_id, model, dim, vector, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT (chunk_id, model) DO UPDATE SET
                         dim = excluded.dim,
                         vector = excluded.vector,
                         created_at = excluded.created_at",
                    params![
                        embedding.chunk_id,
                        embedding.model,
                        embedding.dim as i64,
                        encode_vector(&embedding.vector),
                        to_ts(embedding.created_at),
                    ],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn get(
        chunk_id: &str,
        model: &str,
        store: &SqliteStore,
    ) -> Result<Option<Self>, StoreError> {
        let chunk_id = chunk_id.to_owned();
        let model = model.to_owned();
        store
            .with_conn(move |conn| {
                use rusqlite::OptionalExtension;
                let row = conn
                    .query_row(
                        "SELECT * FROM embedding WHERE chunk_id = ?1 AND model = ?2",
                        params![chunk_id, model],
                        |row| Self::from_row(row),
                    )
                    .optional()?;
                Ok(row)
            })
            .await
    }

    pub async fn count_for_model(model: &str, store: &SqliteStore) -> Result<i64, StoreError> {
        let model = model.to_owned();
        store
            .with_conn(move |conn| {
                let count = conn.query_row(
                    "SELECT COUNT(*) FROM embedding WHERE model = ?1",
                    params![model],
                    |row| row.get(0),
                )?;
                Ok(count)
            })
            .await
    }

    /// Top-k cosine similarity over the stored vectors for `model`. Brute
    /// force over the filtered set; an approximate index can replace the
    /// scan without changing this contract.
    pub async fn ann_search(
        query: &[f32],
        model: &str,
        k: usize,
        filter: &SearchFilter,
        store: &SqliteStore,
    ) -> Result<Vec<AnnHit>, StoreError> {
        let query = query.to_vec();
        let model = model.to_owned();
        let filter = filter.clone();
        store
            .with_conn(move |conn| {
                let mut sql = String::from(
                    "SELECT e.chunk_id, e.vector FROM embedding e
                     JOIN chunk c ON c.chunk_id = e.chunk_id",
                );
                let mut values: Vec<Value> = vec![Value::Text(model)];
                let mut conditions = vec!["e.model = ?1".to_string()];

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

                let mut stmt = conn.prepare(&sql)?;
                let mut hits: Vec<AnnHit> = stmt
                    .query_map(params_from_iter(values), |row| {
                        let chunk_id: String = row.get(0)?;
                        let blob: Vec<u8> = row.get(1)?;
                        Ok((chunk_id, blob))
                    })?
                    .collect::<Result<Vec<_>, _>>()?
                    .into_iter()
                    .map(|(chunk_id, blob)| {
                        let vector = decode_vector(&blob);
                        AnnHit {
                            chunk_id,
                            score: cosine(&query, &vector),
                        }
                    })
                    .collect();

                hits.sort_by(|a, b| {
                    b.score
                        .partial_cmp(&a.score)
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then_with(|| a.chunk_id.cmp(&b.chunk_id))
                });
                hits.truncate(k);
                Ok(hits)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::types::{
        chunk::Chunk,
        span::{NewSpan, Span, SpanKind},
    };

    #[test]
    fn vectors_round_trip_through_blobs() {
        let vector = vec![0.25f32, -1.5, 3.75];
        assert_eq!(decode_vector(&encode_vector(&vector)), vector);
    }

    #[test]
    fn cosine_handles_degenerate_inputs() {
        assert_eq!(cosine(&[], &[]), 0.0);
        assert_eq!(cosine(&[1.0], &[1.0, 2.0]), 0.0);
        assert!((cosine(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
    }

    async fn chunk_fixture(store: &SqliteStore, name: &str, start: u64, body: &str) -> Chunk {
        let span = Span::new(NewSpan {
            repo: "demo",
            path: "src/lib.rs",
            byte_start: start,
            byte_end: start + 50,
            kind: Some(SpanKind::Function),
            name: Some(name),
            signature: None,
            doc: None,
            parents: Vec::new(),
        })
        .expect("span");
        span.upsert(store).await.expect("span upsert");
        let chunk = Chunk::new(&span, body.to_string());
        chunk.upsert(store).await.expect("chunk upsert");
        chunk
    }

    #[tokio::test]
    async fn ann_search_orders_by_similarity() {
        let store = SqliteStore::in_memory().expect("store");
        let near = chunk_fixture(&store, "near", 0, "near body").await;
        let far = chunk_fixture(&store, "far", 100, "far body").await;

        ChunkEmbedding::new(&near.chunk_id, "bge-small", vec![1.0, 0.0, 0.0])
            .upsert(&store)
            .await
            .expect("near embedding");
        ChunkEmbedding::new(&far.chunk_id, "bge-small", vec![0.0, 1.0, 0.0])
            .upsert(&store)
            .await
            .expect("far embedding");

        let hits = ChunkEmbedding::ann_search(
            &[0.9, 0.1, 0.0],
            "bge-small",
            2,
            &SearchFilter::default(),
            &store,
        )
        .await
        .expect("ann search");

        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].chunk_id, near.chunk_id);
        assert!(hits[0].score > hits[1].score);
    }

    #[tokio::test]
    async fn ann_search_is_empty_for_unknown_model() {
        let store = SqliteStore::in_memory().expect("store");
        let chunk = chunk_fixture(&store, "only", 0, "body").await;
        ChunkEmbedding::new(&chunk.chunk_id, "bge-small", vec![1.0, 0.0])
            .upsert(&store)
            .await
            .expect("embedding");

        let hits = ChunkEmbedding::ann_search(
            &[1.0, 0.0],
            "other-model",
            5,
            &SearchFilter::default(),
            &store,
        )
        .await
        .expect("ann search");
        assert!(hits.is_empty());
    }
}
