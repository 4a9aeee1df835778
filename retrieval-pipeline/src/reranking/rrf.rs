use std::collections::HashMap;

use async_trait::async_trait;

use common::error::PampaxError;

use crate::fusion::RRF_K;

use super::{RankedDocument, RerankDocument, RerankProvider};

/// Pure reciprocal-rank fusion. As a bus provider over a single list it
/// re-scores by position; `fuse_rankings` combines multiple pre-ranked
/// lists without any external call.
pub struct RrfFusionProvider;

/// RRF over several already-ordered lists, deduplicating by doc ref.
pub fn fuse_rankings(lists: &[Vec<RankedDocument>]) -> Vec<RankedDocument> {
    let mut scores: HashMap<String, f32> = HashMap::new();
    for list in lists {
        for (position, document) in list.iter().enumerate() {
            *scores.entry(document.doc_ref.clone()).or_default() +=
                1.0 / (RRF_K + (position + 1) as f32);
        }
    }

    let mut fused: Vec<RankedDocument> = scores
        .into_iter()
        .map(|(doc_ref, score)| RankedDocument { doc_ref, score })
        .collect();
    fused.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.doc_ref.cmp(&b.doc_ref))
    });
    fused
}

#[async_trait]
impl RerankProvider for RrfFusionProvider {
    fn id(&self) -> &'static str {
        "rrf_fusion"
    }

    fn is_available(&self) -> bool {
        true
    }

    fn models(&self) -> Vec<String> {
        Vec::new()
    }

    async fn rerank(
        &self,
        _query: &str,
        documents: &[RerankDocument],
    ) -> Result<Vec<RankedDocument>, PampaxError> {
        Ok(documents
            .iter()
            .enumerate()
            .map(|(position, document)| RankedDocument {
                doc_ref: document.doc_ref.clone(),
                score: 1.0 / (RRF_K + (position + 1) as f32),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ranked(ids: &[&str]) -> Vec<RankedDocument> {
        ids.iter()
            .enumerate()
            .map(|(position, id)| RankedDocument {
                doc_ref: (*id).to_string(),
                score: 1.0 / (position + 1) as f32,
            })
            .collect()
    }

    #[test]
    fn agreement_across_lists_wins() {
        let fused = fuse_rankings(&[ranked(&["a", "b", "c"]), ranked(&["b", "a", "d"])]);
        assert_eq!(fused[0].doc_ref, "a");
        assert_eq!(fused[1].doc_ref, "b");
        assert!(fused.iter().any(|d| d.doc_ref == "d"));
    }

    #[test]
    fn fusion_is_deterministic_for_ties() {
        let fused = fuse_rankings(&[ranked(&["b"]), ranked(&["a"])]);
        assert_eq!(fused[0].doc_ref, "a", "equal scores break by doc ref");
    }
}
