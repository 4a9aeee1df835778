use std::{
    num::NonZeroUsize,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
    time::{Duration, Instant},
};

use lru::LruCache;
use serde::Serialize;
use tracing::{debug, warn};

use common::{
    error::PampaxError,
    storage::{db::SqliteStore, types::signature_row::SignatureRow},
    utils::hash::sha256_hex_parts,
};

use crate::{intent::Intent, Bundle};

/// Only outcomes above this satisfaction are worth replaying.
pub const WRITE_FLOOR: f32 = 0.8;

#[derive(Debug, Default, Serialize)]
pub struct SignatureCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub errors: u64,
}

/// Query-signature → bundle cache for high-satisfaction repeats. A hit
/// short-circuits the whole pipeline. In-memory LRU in front of the
/// persisted `signature_cache` table.
pub struct SignatureCache {
    mem: Mutex<LruCache<String, (Bundle, Instant)>>,
    mem_ttl: Duration,
    ttl_days: i64,
    max_size: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    errors: AtomicU64,
}

impl SignatureCache {
    pub fn new(max_size: usize, ttl_days: i64) -> Self {
        Self {
            mem: Mutex::new(LruCache::new(
                NonZeroUsize::new(max_size).unwrap_or(NonZeroUsize::MIN),
            )),
            mem_ttl: Duration::from_secs(300),
            ttl_days,
            max_size,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    /// `sha256(normalized_query | intent | context_bucket)`. The query is
    /// lowercased with whitespace collapsed so formatting differences hit
    /// the same entry.
    pub fn signature_for(query: &str, intent: Intent, context_bucket: &str) -> String {
        let normalized = query
            .to_lowercase()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ");
        sha256_hex_parts(&[&normalized, intent.as_str(), context_bucket])
    }

    pub async fn lookup(&self, store: &SqliteStore, signature: &str) -> Option<Bundle> {
        if let Ok(mut mem) = self.mem.lock() {
            if let Some((bundle, at)) = mem.get(signature) {
                if at.elapsed() < self.mem_ttl {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(bundle.clone());
                }
                mem.pop(signature);
            }
        }

        match SignatureRow::take_valid(signature, store).await {
            Ok(Some(row)) => match serde_json::from_str::<Bundle>(&row.bundle) {
                Ok(bundle) => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    if let Ok(mut mem) = self.mem.lock() {
                        mem.put(signature.to_owned(), (bundle.clone(), Instant::now()));
                    }
                    Some(bundle)
                }
                Err(err) => {
                    warn!(error = %err, "Corrupt signature-cache bundle; dropping");
                    self.errors.fetch_add(1, Ordering::Relaxed);
                    None
                }
            },
            Ok(None) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            Err(err) => {
                warn!(error = %err, "Signature cache read failed");
                self.errors.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Persist a bundle for replay. Entries below the satisfaction floor
    /// are ignored.
    pub async fn record(
        &self,
        store: &SqliteStore,
        signature: &str,
        bundle: &Bundle,
        satisfaction: f32,
    ) -> Result<(), PampaxError> {
        if satisfaction <= WRITE_FLOOR {
            debug!(satisfaction, "Below the signature-cache write floor; skipping");
            return Ok(());
        }

        let encoded = serde_json::to_string(bundle)?;
        SignatureRow::new(signature, &bundle.bundle_id(), encoded, satisfaction, self.ttl_days)
            .put(store)
            .await?;
        SignatureRow::prune(self.max_size, store).await?;

        if let Ok(mut mem) = self.mem.lock() {
            mem.put(signature.to_owned(), (bundle.clone(), Instant::now()));
        }
        Ok(())
    }

    pub fn stats(&self) -> SignatureCacheStats {
        SignatureCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }

    /// Hit rate in [0, 1]; 0 when no lookups happened yet.
    pub fn hit_rate(&self) -> f32 {
        let hits = self.hits.load(Ordering::Relaxed);
        let total = hits + self.misses.load(Ordering::Relaxed);
        if total == 0 {
            0.0
        } else {
            hits as f32 / total as f32
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use crate::{BundleItem, TokenReport};

    fn bundle() -> Bundle {
        Bundle {
            query: "getUserById function".to_string(),
            intent: Intent::Symbol,
            items: vec![BundleItem {
                span_ref: None,
                chunk_id: "c1".to_string(),
                chunk_content: "def get_user_by_id(id): ...".to_string(),
                source: "fts".to_string(),
                score: 0.9,
                rank: 0,
                reasons: Vec::new(),
                tier: "must_have".to_string(),
                content_kind: "code".to_string(),
                original_tokens: 12,
                packed_tokens: 12,
                degradation_level: 0,
            }],
            token_report: TokenReport {
                budget: 2000,
                est_used: 12,
                actual: 12,
                model: "gpt-4o".to_string(),
                per_tier: BTreeMap::new(),
                degradation_level: 0,
            },
            degradation_level: 0,
            stopping_reasons: Vec::new(),
        }
    }

    #[test]
    fn signatures_normalize_whitespace_and_case() {
        let a = SignatureCache::signature_for("GetUserById   function", Intent::Symbol, "b0");
        let b = SignatureCache::signature_for("getuserbyid function", Intent::Symbol, "b0");
        assert_eq!(a, b);

        let c = SignatureCache::signature_for("getuserbyid function", Intent::Search, "b0");
        assert_ne!(a, c, "intent participates in the signature");
    }

    #[tokio::test]
    async fn high_satisfaction_bundles_replay() {
        let store = SqliteStore::in_memory().expect("store");
        let cache = SignatureCache::new(100, 7);
        let signature = SignatureCache::signature_for("q", Intent::Symbol, "b0");

        cache
            .record(&store, &signature, &bundle(), 0.95)
            .await
            .expect("record");

        let replayed = cache.lookup(&store, &signature).await.expect("hit");
        assert_eq!(replayed, bundle());
        assert!(cache.hit_rate() > 0.0);
    }

    #[tokio::test]
    async fn low_satisfaction_outcomes_are_not_cached() {
        let store = SqliteStore::in_memory().expect("store");
        let cache = SignatureCache::new(100, 7);
        let signature = SignatureCache::signature_for("q", Intent::Symbol, "b0");

        cache
            .record(&store, &signature, &bundle(), 0.5)
            .await
            .expect("record");
        assert!(cache.lookup(&store, &signature).await.is_none());
    }
}
