use async_trait::async_trait;

use common::error::PampaxError;

use crate::scoring::{extract_keywords, lexical_overlap_score};

use super::{RankedDocument, RerankDocument, RerankProvider};

/// Deterministic in-process provider for tests and offline runs: scores by
/// query-term overlap blended with a positional prior, so zero-overlap
/// inputs keep their incoming order.
pub struct MockProvider;

#[async_trait]
impl RerankProvider for MockProvider {
    fn id(&self) -> &'static str {
        "mock"
    }

    fn is_available(&self) -> bool {
        true
    }

    fn models(&self) -> Vec<String> {
        vec!["mock".to_string()]
    }

    async fn rerank(
        &self,
        query: &str,
        documents: &[RerankDocument],
    ) -> Result<Vec<RankedDocument>, PampaxError> {
        let terms = extract_keywords(query);
        let mut ranking: Vec<RankedDocument> = documents
            .iter()
            .enumerate()
            .map(|(position, document)| RankedDocument {
                doc_ref: document.doc_ref.clone(),
                score: lexical_overlap_score(&terms, &document.text)
                    + 0.5 / (position + 1) as f32,
            })
            .collect();
        ranking.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.doc_ref.cmp(&b.doc_ref))
        });
        Ok(ranking)
    }
}
