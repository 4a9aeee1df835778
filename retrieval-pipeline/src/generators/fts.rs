use async_trait::async_trait;
use tracing::debug;

use common::{error::PampaxError, storage::types::chunk::Chunk};

use super::{CandidateGenerator, CandidateRef, CandidateSource, GeneratorContext};

/// Lexical evidence from the porter-tokenized `chunk_fts` mirror.
pub struct FtsGenerator;

#[async_trait]
impl CandidateGenerator for FtsGenerator {
    fn source(&self) -> CandidateSource {
        CandidateSource::Fts
    }

    async fn generate(
        &self,
        ctx: &GeneratorContext<'_>,
        k: usize,
    ) -> Result<Vec<CandidateRef>, PampaxError> {
        let hits = Chunk::fts_search(ctx.query, k, ctx.filter, ctx.store).await?;
        debug!(hits = hits.len(), "FTS candidates");
        Ok(hits
            .into_iter()
            .enumerate()
            .map(|(index, hit)| CandidateRef {
                chunk_id: hit.chunk.chunk_id,
                source: CandidateSource::Fts,
                raw_score: hit.score,
                rank_in_source: index + 1,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::storage::{
        db::SqliteStore,
        types::span::{NewSpan, Span, SpanKind},
        SearchFilter,
    };

    use crate::intent::IntentClassifier;
    use crate::policy::PolicyGate;

    #[tokio::test]
    async fn ranked_hits_become_candidate_refs() {
        let store = SqliteStore::in_memory().expect("store");
        let span = Span::new(NewSpan {
            repo: "demo",
            path: "src/db.rs",
            byte_start: 0,
            byte_end: 50,
            kind: Some(SpanKind::Function),
            name: Some("connect"),
            signature: None,
            doc: None,
            parents: Vec::new(),
        })
        .expect("span");
        span.upsert(&store).await.expect("span");
        Chunk::new(&span, "open the database connection pool".to_string())
            .upsert(&store)
            .await
            .expect("chunk");

        let intent = IntentClassifier::new()
            .classify("database connection", None)
            .expect("intent");
        let policy = PolicyGate::default_for(intent.intent);
        let filter = SearchFilter::default();
        let ctx = GeneratorContext {
            store: &store,
            query: "database connection",
            intent: &intent,
            policy: &policy,
            filter: &filter,
            session_id: None,
            embedder: None,
            embedding_model: "bge-small",
        };

        let candidates = FtsGenerator.generate(&ctx, 10).await.expect("generate");
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].rank_in_source, 1);
        assert!(candidates[0].raw_score.is_finite());
    }
}
