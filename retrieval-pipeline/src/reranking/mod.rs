pub mod http;
pub mod local;
pub mod mock;
pub mod rrf;

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use common::{
    error::PampaxError,
    reliability::{retry, Bulkhead, CircuitBreaker, RetryPolicy},
    storage::{db::SqliteStore, types::rerank_cache_row::RerankCacheRow},
    utils::{config::RerankConfig, hash::sha256_hex_parts},
};

/// Document handed to a provider: a stable reference plus the text scored.
#[derive(Debug, Clone, PartialEq)]
pub struct RerankDocument {
    pub doc_ref: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedDocument {
    pub doc_ref: String,
    pub score: f32,
}

#[async_trait]
pub trait RerankProvider: Send + Sync {
    fn id(&self) -> &'static str;
    fn is_available(&self) -> bool;
    fn models(&self) -> Vec<String>;

    async fn rerank(
        &self,
        query: &str,
        documents: &[RerankDocument],
    ) -> Result<Vec<RankedDocument>, PampaxError>;
}

pub const KNOWN_PROVIDER_IDS: &[&str] = &[
    "local_cross_encoder",
    "api_cohere",
    "api_voyage",
    "rrf_fusion",
    "mock",
];

#[derive(Debug, Clone)]
pub struct RerankOutcome {
    pub ranking: Vec<RankedDocument>,
    pub provider: String,
    pub cache_hit: bool,
}

/// Routes rerank calls to the configured provider with fallback, wrapping
/// every invocation in a breaker, bulkhead, timeout, and retry, behind a
/// SHA-keyed store-backed result cache.
pub struct RerankerBus {
    providers: HashMap<&'static str, Arc<dyn RerankProvider>>,
    order: Vec<String>,
    breakers: HashMap<&'static str, CircuitBreaker>,
    bulkhead: Bulkhead,
    retry_policy: RetryPolicy,
    timeout: Duration,
    cache_ttl_hours: i64,
    model: String,
}

impl std::fmt::Debug for RerankerBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RerankerBus")
            .field("providers", &self.providers.keys().collect::<Vec<_>>())
            .field("order", &self.order)
            .field("breakers", &self.breakers.keys().collect::<Vec<_>>())
            .field("bulkhead", &self.bulkhead)
            .field("retry_policy", &self.retry_policy)
            .field("timeout", &self.timeout)
            .field("cache_ttl_hours", &self.cache_ttl_hours)
            .field("model", &self.model)
            .finish()
    }
}

impl RerankerBus {
    /// Build the bus from configuration. Every provider id named in the
    /// primary/fallback order must be known; unknown ids are an
    /// `InvalidInput` error, not a silent fallback.
    pub fn from_config(
        config: &RerankConfig,
        max_concurrent: usize,
        timeout: Duration,
        cache_ttl_hours: i64,
    ) -> Result<Self, PampaxError> {
        let mut order = vec![config.primary.clone()];
        for id in &config.fallback {
            if !order.contains(id) {
                order.push(id.clone());
            }
        }
        for id in &order {
            if !KNOWN_PROVIDER_IDS.contains(&id.as_str()) {
                return Err(PampaxError::InvalidInput(format!(
                    "unknown rerank provider '{id}'"
                )));
            }
        }

        let mut providers: HashMap<&'static str, Arc<dyn RerankProvider>> = HashMap::new();
        providers.insert("rrf_fusion", Arc::new(rrf::RrfFusionProvider));
        providers.insert("mock", Arc::new(mock::MockProvider));
        providers.insert(
            "api_cohere",
            Arc::new(http::CohereProvider::new(
                config.cohere_api_key.clone(),
                config.model.clone(),
            )),
        );
        providers.insert(
            "api_voyage",
            Arc::new(http::VoyageProvider::new(
                config.voyage_api_key.clone(),
                config.model.clone(),
            )),
        );
        // The local cross-encoder is heavyweight; only spin it up when the
        // order actually names it.
        let local = if order.iter().any(|id| id == "local_cross_encoder") {
            local::LocalCrossEncoder::initialize(2)
        } else {
            local::LocalCrossEncoder::disabled()
        };
        providers.insert("local_cross_encoder", Arc::new(local));

        let breakers = KNOWN_PROVIDER_IDS
            .iter()
            .map(|id| (*id, CircuitBreaker::new(id, Default::default())))
            .collect();

        Ok(Self {
            providers,
            order,
            breakers,
            bulkhead: Bulkhead::new("rerank", max_concurrent),
            retry_policy: RetryPolicy::default(),
            timeout,
            cache_ttl_hours,
            model: config.model.clone(),
        })
    }

    pub fn provider(&self, id: &str) -> Result<&Arc<dyn RerankProvider>, PampaxError> {
        self.providers
            .get(id)
            .ok_or_else(|| PampaxError::InvalidInput(format!("unknown rerank provider '{id}'")))
    }

    fn cache_key(provider: &str, model: &str, query: &str, documents: &[RerankDocument]) -> String {
        let mut ids: Vec<&str> = documents.iter().map(|d| d.doc_ref.as_str()).collect();
        ids.sort_unstable();
        sha256_hex_parts(&[provider, model, query, &ids.join(",")])
    }

    /// Rerank through the provider order, returning the first success.
    /// Within the cache TTL the same `(provider, model, query, doc set)`
    /// returns a bit-identical ranking without touching the provider.
    pub async fn rerank(
        &self,
        store: &SqliteStore,
        query: &str,
        documents: Vec<RerankDocument>,
        provider_override: Option<&str>,
    ) -> Result<RerankOutcome, PampaxError> {
        if documents.is_empty() {
            return Ok(RerankOutcome {
                ranking: Vec::new(),
                provider: "none".to_string(),
                cache_hit: false,
            });
        }

        let mut order: Vec<String> = Vec::new();
        if let Some(id) = provider_override {
            // Validate eagerly so a typo is an error, not a fallback.
            self.provider(id)?;
            order.push(id.to_owned());
        }
        for id in &self.order {
            if !order.contains(id) {
                order.push(id.clone());
            }
        }

        let mut last_error: Option<PampaxError> = None;
        for id in &order {
            let provider = self.provider(id)?;
            let key = Self::cache_key(id, &self.model, query, &documents);

            match RerankCacheRow::get_valid(&key, store).await {
                Ok(Some(cached)) => {
                    let ranking: Vec<RankedDocument> = serde_json::from_str(&cached)?;
                    debug!(provider = %id, "Rerank cache hit");
                    return Ok(RerankOutcome {
                        ranking,
                        provider: id.clone(),
                        cache_hit: true,
                    });
                }
                Ok(None) => {}
                Err(err) => warn!(error = %err, "Rerank cache read failed; continuing"),
            }

            if !provider.is_available() {
                debug!(provider = %id, "Provider unavailable; trying next");
                continue;
            }

            let Some(breaker) = self.breakers.get(id.as_str()) else {
                continue;
            };
            if breaker.try_acquire().is_err() {
                debug!(provider = %id, "Circuit open; trying next");
                continue;
            }

            let call = self.bulkhead.run(retry(&self.retry_policy, || async {
                match tokio::time::timeout(self.timeout, provider.rerank(query, &documents)).await
                {
                    Ok(result) => result,
                    Err(_) => Err(PampaxError::Timeout(format!(
                        "rerank provider '{id}' exceeded {}ms",
                        self.timeout.as_millis()
                    ))),
                }
            }));

            match call.await {
                Ok(ranking) => {
                    breaker.record_success();
                    let encoded = serde_json::to_string(&ranking)?;
                    if let Err(err) =
                        RerankCacheRow::new(&key, id, Some(&self.model), encoded, self.cache_ttl_hours)
                            .put(store)
                            .await
                    {
                        warn!(error = %err, "Rerank cache write failed; continuing");
                    }
                    return Ok(RerankOutcome {
                        ranking,
                        provider: id.clone(),
                        cache_hit: false,
                    });
                }
                Err(err) => {
                    breaker.record_failure();
                    warn!(provider = %id, error = %err, "Rerank provider failed");
                    last_error = Some(err);
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| PampaxError::Unavailable("no rerank provider succeeded".to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(primary: &str) -> RerankConfig {
        RerankConfig {
            primary: primary.to_string(),
            fallback: vec!["mock".to_string()],
            ..RerankConfig::default()
        }
    }

    fn documents() -> Vec<RerankDocument> {
        vec![
            RerankDocument {
                doc_ref: "c1".to_string(),
                text: "user lookup by id".to_string(),
            },
            RerankDocument {
                doc_ref: "c2".to_string(),
                text: "unrelated parser".to_string(),
            },
        ]
    }

    #[test]
    fn unknown_provider_ids_are_invalid_input() {
        let err = RerankerBus::from_config(
            &config("definitely_not_real"),
            4,
            Duration::from_secs(10),
            24,
        )
        .expect_err("unknown id");
        assert!(matches!(err, PampaxError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn cache_hits_are_bit_identical_and_skip_the_provider() {
        let store = SqliteStore::in_memory().expect("store");
        let bus = RerankerBus::from_config(&config("mock"), 4, Duration::from_secs(10), 24)
            .expect("bus");

        let first = bus
            .rerank(&store, "user lookup", documents(), None)
            .await
            .expect("first");
        assert!(!first.cache_hit);
        assert_eq!(first.ranking[0].doc_ref, "c1");

        let second = bus
            .rerank(&store, "user lookup", documents(), None)
            .await
            .expect("second");
        assert!(second.cache_hit);
        assert_eq!(second.ranking, first.ranking);
    }

    #[tokio::test]
    async fn unavailable_primaries_fall_back_in_declared_order() {
        let store = SqliteStore::in_memory().expect("store");
        // Cohere has no API key here, so it reports unavailable.
        let bus = RerankerBus::from_config(&config("api_cohere"), 4, Duration::from_secs(10), 24)
            .expect("bus");

        let outcome = bus
            .rerank(&store, "user lookup", documents(), None)
            .await
            .expect("fallback");
        assert_eq!(outcome.provider, "mock");
    }

    #[tokio::test]
    async fn override_must_name_a_known_provider() {
        let store = SqliteStore::in_memory().expect("store");
        let bus = RerankerBus::from_config(&config("mock"), 4, Duration::from_secs(10), 24)
            .expect("bus");
        let err = bus
            .rerank(&store, "q", documents(), Some("nope"))
            .await
            .expect_err("unknown override");
        assert!(matches!(err, PampaxError::InvalidInput(_)));
    }
}
