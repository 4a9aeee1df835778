use std::time::Duration;

use common::utils::config::{AppConfig, FeatureFlags};

/// Pipeline-facing view of the application configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Per-generator take before fusion.
    pub candidate_k: usize,
    /// Fused candidates entering the packer.
    pub result_limit: usize,
    pub default_token_budget: usize,
    pub default_model: String,
    pub embedding_model: String,
    pub generator_timeout: Duration,
    pub assembly_timeout: Duration,
    pub search_timeout: Duration,
    pub rerank_timeout: Duration,
    pub rerank_top_n: usize,
    /// Fraction of the token budget the graph expander may spend.
    pub graph_budget_share: f32,
    pub graph_seed_limit: usize,
    pub features: FeatureFlags,
    pub signature_max_size: usize,
    pub signature_ttl_days: i64,
    pub rerank_cache_ttl_hours: i64,
    pub seed_profile_max: usize,
    pub seed_profile_ttl: Duration,
    pub graph_cache_max: usize,
    pub graph_cache_ttl: Duration,
    pub graph_fanout: usize,
    pub max_concurrent_expansions: usize,
    pub max_concurrent_external: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::from_app(&AppConfig::default())
    }
}

impl PipelineConfig {
    pub fn from_app(config: &AppConfig) -> Self {
        Self {
            candidate_k: 50,
            result_limit: 50,
            default_token_budget: 8_000,
            default_model: "claude-3-sonnet".to_string(),
            embedding_model: config.embedding.model.clone(),
            generator_timeout: Duration::from_millis(config.timeouts.generator_ms),
            assembly_timeout: Duration::from_millis(config.timeouts.assembly_ms),
            search_timeout: Duration::from_millis(config.timeouts.search_ms),
            rerank_timeout: Duration::from_millis(config.timeouts.rerank_ms),
            rerank_top_n: config.rerank.top_n,
            graph_budget_share: 0.25,
            graph_seed_limit: 5,
            features: config.features.clone(),
            signature_max_size: config.cache.signature_max_size,
            signature_ttl_days: config.cache.signature_ttl_days,
            rerank_cache_ttl_hours: config.cache.rerank_ttl_hours,
            seed_profile_max: config.cache.seed_profile_max,
            seed_profile_ttl: Duration::from_secs(config.cache.seed_profile_ttl_secs),
            graph_cache_max: config.cache.graph_max,
            graph_cache_ttl: Duration::from_secs(config.cache.graph_ttl_secs),
            graph_fanout: config.limits.graph_fanout,
            max_concurrent_expansions: config.limits.max_concurrent_expansions,
            max_concurrent_external: config.limits.max_concurrent_external,
        }
    }
}
