use async_trait::async_trait;
use tracing::debug;

use common::{error::PampaxError, storage::types::embedding::ChunkEmbedding};

use super::{CandidateGenerator, CandidateRef, CandidateSource, GeneratorContext};

/// Semantic evidence via ANN over the stored vectors for the active
/// embedding model. Contributes nothing (not an error) when no embedder is
/// configured or the model has no vectors yet.
pub struct VectorGenerator;

#[async_trait]
impl CandidateGenerator for VectorGenerator {
    fn source(&self) -> CandidateSource {
        CandidateSource::Vector
    }

    async fn generate(
        &self,
        ctx: &GeneratorContext<'_>,
        k: usize,
    ) -> Result<Vec<CandidateRef>, PampaxError> {
        let Some(embedder) = ctx.embedder else {
            debug!("No embedding provider configured; vector source is idle");
            return Ok(Vec::new());
        };

        let query_vector = embedder.embed(ctx.query).await?;
        let hits = ChunkEmbedding::ann_search(
            &query_vector,
            ctx.embedding_model,
            k,
            ctx.filter,
            ctx.store,
        )
        .await?;
        debug!(hits = hits.len(), model = ctx.embedding_model, "Vector candidates");

        Ok(hits
            .into_iter()
            .enumerate()
            .map(|(index, hit)| CandidateRef {
                chunk_id: hit.chunk_id,
                source: CandidateSource::Vector,
                raw_score: hit.score,
                rank_in_source: index + 1,
            })
            .collect())
    }
}
