use async_trait::async_trait;
use tracing::debug;

use common::{
    error::PampaxError,
    storage::types::memory_item::{MemoryFilter, MemoryItem},
};

use crate::scoring::{extract_keywords, lexical_overlap_score};

use super::{CandidateGenerator, CandidateRef, CandidateSource, GeneratorContext};

/// Session memory evidence. Items are fetched for the active session and
/// scored by term overlap against content and metadata; there is no second
/// FTS index over memories.
pub struct MemoryGenerator;

#[async_trait]
impl CandidateGenerator for MemoryGenerator {
    fn source(&self) -> CandidateSource {
        CandidateSource::Memory
    }

    async fn generate(
        &self,
        ctx: &GeneratorContext<'_>,
        k: usize,
    ) -> Result<Vec<CandidateRef>, PampaxError> {
        let Some(session_id) = ctx.session_id else {
            return Ok(Vec::new());
        };

        // A policy that de-weights memory below the default signals
        // pinned-only retrieval.
        let pinned_only = ctx.policy.weight("memory") < 1.0;
        let items = MemoryItem::query(
            MemoryFilter {
                session_id: Some(session_id.to_owned()),
                pinned_only,
                ..MemoryFilter::default()
            },
            ctx.store,
        )
        .await?;

        let terms = extract_keywords(ctx.query);
        let mut scored: Vec<(MemoryItem, f32)> = items
            .into_iter()
            .map(|item| {
                let haystack = match &item.metadata {
                    serde_json::Value::Null => item.content.clone(),
                    metadata => format!("{} {metadata}", item.content),
                };
                let score = lexical_overlap_score(&terms, &haystack);
                (item, score)
            })
            .filter(|(_, score)| *score > 0.0)
            .collect();

        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.id.cmp(&b.0.id))
        });
        scored.truncate(k);
        debug!(hits = scored.len(), "Memory candidates");

        Ok(scored
            .into_iter()
            .enumerate()
            .map(|(index, (item, score))| CandidateRef {
                chunk_id: item.id,
                source: CandidateSource::Memory,
                raw_score: score,
                rank_in_source: index + 1,
            })
            .collect())
    }
}
