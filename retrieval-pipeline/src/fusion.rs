use std::{
    collections::HashMap,
    num::NonZeroUsize,
    sync::Mutex,
    time::{Duration, Instant},
};

use lru::LruCache;
use serde::Serialize;
use tracing::debug;

use common::{storage::types::policy_row::PolicyDecision, utils::hash::sha256_hex};

use crate::{
    generators::{CandidateRef, CandidateSource},
    intent::Intent,
};

/// Reciprocal-rank-fusion constant.
pub const RRF_K: f32 = 60.0;

/// Early-stop fires when the score at the threshold falls below this
/// fraction of the top score.
const EARLY_STOP_RATIO: f32 = 0.30;

/// One deduplicated candidate after fusion, carrying every source that
/// contributed to it.
#[derive(Debug, Clone, Serialize)]
pub struct FusedCandidate {
    pub chunk_id: String,
    pub score: f32,
    pub sources: Vec<CandidateSource>,
    /// Best raw per-source score, the first RRF tie-break.
    pub max_source_score: f32,
    pub reasons: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct FusionOutcome {
    pub candidates: Vec<FusedCandidate>,
    pub early_stopped: bool,
}

struct CachedProfile {
    weights: HashMap<CandidateSource, f32>,
    at: Instant,
}

/// Fuses per-source ranked lists with intent-aware weighted RRF. The
/// effective weight profile per `(intent, confidence bucket, policy)` is
/// kept in a TTL'd LRU cache.
pub struct SeedMixOptimizer {
    profiles: Mutex<LruCache<String, CachedProfile>>,
    ttl: Duration,
}

impl SeedMixOptimizer {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            profiles: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN),
            )),
            ttl,
        }
    }

    /// Intent-profile multiplier layered onto the policy seed weight.
    fn intent_multiplier(intent: Intent, source: CandidateSource) -> f32 {
        use CandidateSource::{Fts, Graph, Memory, Symbol, Vector};
        match intent {
            Intent::Symbol => match source {
                Symbol => 1.5,
                Fts => 1.2,
                Memory => 0.8,
                Vector | Graph => 1.0,
            },
            Intent::Config => match source {
                Fts => 1.4,
                Symbol => 0.6,
                Vector | Memory | Graph => 1.0,
            },
            Intent::Api => match source {
                Symbol | Fts | Graph => 1.2,
                Vector | Memory => 1.0,
            },
            Intent::Incident => match source {
                Vector | Memory => 1.2,
                Graph => 1.3,
                Fts | Symbol => 1.0,
            },
            Intent::Search => 1.0,
        }
    }

    fn effective_weights(
        &self,
        intent: Intent,
        confidence: f32,
        policy: &PolicyDecision,
    ) -> HashMap<CandidateSource, f32> {
        let policy_hash = sha256_hex(&serde_json::to_string(policy).unwrap_or_default());
        let confidence_bucket = (confidence * 10.0).round() as u8;
        let key = format!("{intent}|{confidence_bucket}|{policy_hash}");

        if let Ok(mut profiles) = self.profiles.lock() {
            if let Some(cached) = profiles.get(&key) {
                if cached.at.elapsed() < self.ttl {
                    return cached.weights.clone();
                }
                profiles.pop(&key);
            }
        }

        let sources = [
            CandidateSource::Fts,
            CandidateSource::Vector,
            CandidateSource::Memory,
            CandidateSource::Symbol,
            CandidateSource::Graph,
        ];
        let weights: HashMap<CandidateSource, f32> = sources
            .into_iter()
            .map(|source| {
                let weight =
                    policy.weight(source.as_str()) * Self::intent_multiplier(intent, source);
                (source, weight)
            })
            .collect();

        if let Ok(mut profiles) = self.profiles.lock() {
            profiles.put(
                key,
                CachedProfile {
                    weights: weights.clone(),
                    at: Instant::now(),
                },
            );
        }
        weights
    }

    /// Weighted RRF over the per-source lists with chunk-id dedup. Order of
    /// the output is a pure function of the inputs: score desc, then max
    /// per-source raw score desc, then chunk id.
    pub fn fuse(
        &self,
        lists: &[(CandidateSource, Vec<CandidateRef>)],
        policy: &PolicyDecision,
        intent: Intent,
        confidence: f32,
        limit: usize,
    ) -> FusionOutcome {
        let weights = self.effective_weights(intent, confidence, policy);

        let mut fused: HashMap<String, FusedCandidate> = HashMap::new();
        for (source, candidates) in lists {
            let weight = weights.get(source).copied().unwrap_or(1.0);
            for candidate in candidates {
                let contribution = weight / (RRF_K + candidate.rank_in_source as f32);
                let entry = fused
                    .entry(candidate.chunk_id.clone())
                    .or_insert_with(|| FusedCandidate {
                        chunk_id: candidate.chunk_id.clone(),
                        score: 0.0,
                        sources: Vec::new(),
                        max_source_score: f32::MIN,
                        reasons: Vec::new(),
                    });
                entry.score += contribution;
                if !entry.sources.contains(source) {
                    entry.sources.push(*source);
                }
                entry.max_source_score = entry.max_source_score.max(candidate.raw_score);
                entry.reasons.push(format!(
                    "{source} rank {} (w={weight:.2})",
                    candidate.rank_in_source
                ));
            }
        }

        let mut candidates: Vec<FusedCandidate> = fused.into_values().collect();
        candidates.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    b.max_source_score
                        .partial_cmp(&a.max_source_score)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });

        let threshold = policy.early_stop_threshold;
        let mut early_stopped = false;
        if candidates.len() > threshold && threshold >= 1 {
            let top = candidates.first().map(|c| c.score).unwrap_or(0.0);
            let at_threshold = candidates
                .get(threshold - 1)
                .map(|c| c.score)
                .unwrap_or(0.0);
            if top > 0.0 && at_threshold / top < EARLY_STOP_RATIO {
                candidates.truncate(threshold);
                early_stopped = true;
                debug!(threshold, "Early stop truncated the fused list");
            }
        }

        candidates.truncate(limit);
        FusionOutcome {
            candidates,
            early_stopped,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::PolicyGate;

    fn optimizer() -> SeedMixOptimizer {
        SeedMixOptimizer::new(16, Duration::from_secs(300))
    }

    fn refs(source: CandidateSource, ids: &[&str]) -> (CandidateSource, Vec<CandidateRef>) {
        (
            source,
            ids.iter()
                .enumerate()
                .map(|(index, id)| CandidateRef {
                    chunk_id: (*id).to_string(),
                    source,
                    raw_score: 1.0 / (index + 1) as f32,
                    rank_in_source: index + 1,
                })
                .collect(),
        )
    }

    #[test]
    fn candidates_in_multiple_sources_sum_contributions() {
        let policy = PolicyGate::default_for(Intent::Search);
        let lists = vec![
            refs(CandidateSource::Fts, &["shared", "fts-only"]),
            refs(CandidateSource::Vector, &["shared", "vec-only"]),
        ];

        let outcome = optimizer().fuse(&lists, &policy, Intent::Search, 0.5, 10);
        let shared = outcome
            .candidates
            .iter()
            .find(|c| c.chunk_id == "shared")
            .expect("shared candidate");
        assert_eq!(shared.sources.len(), 2);
        assert_eq!(outcome.candidates[0].chunk_id, "shared");

        let single = outcome
            .candidates
            .iter()
            .find(|c| c.chunk_id == "fts-only")
            .expect("single-source candidate");
        assert!(shared.score > single.score);
    }

    #[test]
    fn rrf_scores_follow_the_formula() {
        let policy = PolicyGate::default_for(Intent::Search);
        let lists = vec![refs(CandidateSource::Fts, &["a"])];
        let outcome = optimizer().fuse(&lists, &policy, Intent::Search, 0.5, 10);
        // weight 1.0 (policy) * 1.0 (search multiplier) / (60 + 1)
        assert!((outcome.candidates[0].score - 1.0 / 61.0).abs() < 1e-6);
    }

    #[test]
    fn ties_break_on_max_source_score_then_id() {
        let policy = PolicyGate::default_for(Intent::Search);
        let lists = vec![
            (
                CandidateSource::Fts,
                vec![
                    CandidateRef {
                        chunk_id: "zzz".to_string(),
                        source: CandidateSource::Fts,
                        raw_score: 9.0,
                        rank_in_source: 1,
                    },
                ],
            ),
            (
                CandidateSource::Vector,
                vec![CandidateRef {
                    chunk_id: "aaa".to_string(),
                    source: CandidateSource::Vector,
                    raw_score: 0.5,
                    rank_in_source: 1,
                }],
            ),
        ];
        let outcome = optimizer().fuse(&lists, &policy, Intent::Search, 0.5, 10);
        // Same RRF score; the higher raw source score wins.
        assert_eq!(outcome.candidates[0].chunk_id, "zzz");
    }

    #[test]
    fn early_stop_truncates_a_flat_tail() {
        let mut policy = PolicyGate::default_for(Intent::Search);
        policy.early_stop_threshold = 2;

        // One dominant multi-source candidate, then a long weak tail.
        let lists = vec![
            (
                CandidateSource::Fts,
                vec![
                    CandidateRef {
                        chunk_id: "top".to_string(),
                        source: CandidateSource::Fts,
                        raw_score: 1.0,
                        rank_in_source: 1,
                    },
                    CandidateRef {
                        chunk_id: "tail-1".to_string(),
                        source: CandidateSource::Fts,
                        raw_score: 0.1,
                        rank_in_source: 500,
                    },
                    CandidateRef {
                        chunk_id: "tail-2".to_string(),
                        source: CandidateSource::Fts,
                        raw_score: 0.1,
                        rank_in_source: 600,
                    },
                ],
            ),
            refs(CandidateSource::Vector, &["top"]),
            refs(CandidateSource::Symbol, &["top"]),
        ];

        let outcome = optimizer().fuse(&lists, &policy, Intent::Search, 0.5, 10);
        assert!(outcome.early_stopped);
        assert_eq!(outcome.candidates.len(), 2);
    }

    #[test]
    fn intent_multipliers_shift_the_mix() {
        let policy = PolicyGate::default_for(Intent::Symbol);
        let lists = vec![
            refs(CandidateSource::Symbol, &["sym"]),
            refs(CandidateSource::Memory, &["mem"]),
        ];
        let outcome = optimizer().fuse(&lists, &policy, Intent::Symbol, 0.6, 10);
        assert_eq!(outcome.candidates[0].chunk_id, "sym");
    }
}
