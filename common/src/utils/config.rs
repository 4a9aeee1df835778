use std::collections::BTreeMap;

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingBackend {
    Disabled,
    OpenAI,
    FastEmbed,
}

fn default_embedding_backend() -> EmbeddingBackend {
    EmbeddingBackend::Disabled
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_backend")]
    pub backend: EmbeddingBackend,
    #[serde(default = "default_embedding_model")]
    pub model: String,
    #[serde(default = "default_embedding_dimensions")]
    pub dimensions: u32,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_openai_base_url")]
    pub base_url: String,
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}

fn default_embedding_dimensions() -> u32 {
    1536
}

fn default_openai_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            backend: default_embedding_backend(),
            model: default_embedding_model(),
            dimensions: default_embedding_dimensions(),
            api_key: None,
            base_url: default_openai_base_url(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RerankConfig {
    /// Provider id tried first; see the provider registry for valid ids.
    #[serde(default = "default_rerank_primary")]
    pub primary: String,
    /// Providers tried, in order, when the primary fails or is unavailable.
    #[serde(default)]
    pub fallback: Vec<String>,
    #[serde(default)]
    pub cohere_api_key: Option<String>,
    #[serde(default)]
    pub voyage_api_key: Option<String>,
    #[serde(default = "default_rerank_model")]
    pub model: String,
    #[serde(default = "default_rerank_top_n")]
    pub top_n: usize,
}

fn default_rerank_primary() -> String {
    "rrf_fusion".to_string()
}

fn default_rerank_model() -> String {
    "rerank-v3".to_string()
}

fn default_rerank_top_n() -> usize {
    50
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self {
            primary: default_rerank_primary(),
            fallback: Vec::new(),
            cohere_api_key: None,
            voyage_api_key: None,
            model: default_rerank_model(),
            top_n: default_rerank_top_n(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_signature_max_size")]
    pub signature_max_size: usize,
    #[serde(default = "default_signature_ttl_days")]
    pub signature_ttl_days: i64,
    #[serde(default = "default_rerank_ttl_hours")]
    pub rerank_ttl_hours: i64,
    #[serde(default = "default_profile_ttl_secs")]
    pub seed_profile_ttl_secs: u64,
    #[serde(default = "default_profile_max")]
    pub seed_profile_max: usize,
    #[serde(default = "default_graph_cache_max")]
    pub graph_max: usize,
    #[serde(default = "default_graph_ttl_secs")]
    pub graph_ttl_secs: u64,
    #[serde(default = "default_token_count_cache")]
    pub token_count_entries: usize,
}

fn default_signature_max_size() -> usize {
    1000
}
fn default_signature_ttl_days() -> i64 {
    7
}
fn default_rerank_ttl_hours() -> i64 {
    24
}
fn default_profile_ttl_secs() -> u64 {
    300
}
fn default_profile_max() -> usize {
    1000
}
fn default_graph_cache_max() -> usize {
    1000
}
fn default_graph_ttl_secs() -> u64 {
    300
}
fn default_token_count_cache() -> usize {
    4096
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            signature_max_size: default_signature_max_size(),
            signature_ttl_days: default_signature_ttl_days(),
            rerank_ttl_hours: default_rerank_ttl_hours(),
            seed_profile_ttl_secs: default_profile_ttl_secs(),
            seed_profile_max: default_profile_max(),
            graph_max: default_graph_cache_max(),
            graph_ttl_secs: default_graph_ttl_secs(),
            token_count_entries: default_token_count_cache(),
        }
    }
}

/// Per-class operation timeouts in milliseconds. Callers may override per
/// call; these are the ambient defaults.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_search_timeout_ms")]
    pub search_ms: u64,
    #[serde(default = "default_assembly_timeout_ms")]
    pub assembly_ms: u64,
    #[serde(default = "default_database_timeout_ms")]
    pub database_ms: u64,
    #[serde(default = "default_cache_timeout_ms")]
    pub cache_ms: u64,
    #[serde(default = "default_external_timeout_ms")]
    pub external_ms: u64,
    #[serde(default = "default_generator_timeout_ms")]
    pub generator_ms: u64,
    #[serde(default = "default_rerank_timeout_ms")]
    pub rerank_ms: u64,
}

fn default_search_timeout_ms() -> u64 {
    5_000
}
fn default_assembly_timeout_ms() -> u64 {
    10_000
}
fn default_database_timeout_ms() -> u64 {
    2_000
}
fn default_cache_timeout_ms() -> u64 {
    1_000
}
fn default_external_timeout_ms() -> u64 {
    8_000
}
fn default_generator_timeout_ms() -> u64 {
    300
}
fn default_rerank_timeout_ms() -> u64 {
    10_000
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            search_ms: default_search_timeout_ms(),
            assembly_ms: default_assembly_timeout_ms(),
            database_ms: default_database_timeout_ms(),
            cache_ms: default_cache_timeout_ms(),
            external_ms: default_external_timeout_ms(),
            generator_ms: default_generator_timeout_ms(),
            rerank_ms: default_rerank_timeout_ms(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LimitConfig {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_external: usize,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_expansions: usize,
    #[serde(default = "default_graph_fanout")]
    pub graph_fanout: usize,
}

fn default_max_concurrent() -> usize {
    10
}
fn default_graph_fanout() -> usize {
    8
}

impl Default for LimitConfig {
    fn default() -> Self {
        Self {
            max_concurrent_external: default_max_concurrent(),
            max_concurrent_expansions: default_max_concurrent(),
            graph_fanout: default_graph_fanout(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FeatureFlags {
    #[serde(default = "default_true")]
    pub memory: bool,
    #[serde(default = "default_true")]
    pub graph: bool,
    #[serde(default = "default_true")]
    pub rerank: bool,
    #[serde(default = "default_true")]
    pub signature_cache: bool,
}

fn default_true() -> bool {
    true
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            memory: true,
            graph: true,
            rerank: true,
            signature_cache: true,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TokenizerConfig {
    /// Calibrated fallback ratio used when a family has no bundled tokenizer.
    #[serde(default = "default_chars_per_token")]
    pub default_chars_per_token: f32,
    /// Optional `family -> tokenizer.json path` overrides.
    #[serde(default)]
    pub files: BTreeMap<String, String>,
}

fn default_chars_per_token() -> f32 {
    3.8
}

impl Default for TokenizerConfig {
    fn default() -> Self {
        Self {
            default_chars_per_token: default_chars_per_token(),
            files: BTreeMap::new(),
        }
    }
}

/// Patterns consumed by the external indexer collaborator; carried here so
/// `config show/validate/export` covers the whole surface.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct IndexerConfig {
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LearningConfig {
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f32,
    #[serde(default = "default_conv_threshold")]
    pub conv_threshold: f32,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    #[serde(default = "default_min_signals")]
    pub min_signals_per_intent: usize,
    /// A fix faster than this counts as a satisfied outcome.
    #[serde(default = "default_satisfied_fix_ms")]
    pub satisfied_fix_threshold_ms: u64,
}

fn default_learning_rate() -> f32 {
    0.1
}
fn default_conv_threshold() -> f32 {
    1e-3
}
fn default_max_iterations() -> usize {
    100
}
fn default_min_signals() -> usize {
    5
}
fn default_satisfied_fix_ms() -> u64 {
    300_000
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            learning_rate: default_learning_rate(),
            conv_threshold: default_conv_threshold(),
            max_iterations: default_max_iterations(),
            min_signals_per_intent: default_min_signals(),
            satisfied_fix_threshold_ms: default_satisfied_fix_ms(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_storage_path")]
    pub storage_path: String,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub rerank: RerankConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub limits: LimitConfig,
    #[serde(default)]
    pub features: FeatureFlags,
    #[serde(default)]
    pub tokenizer: TokenizerConfig,
    #[serde(default)]
    pub indexer: IndexerConfig,
    #[serde(default)]
    pub learning: LearningConfig,
}

fn default_storage_path() -> String {
    "./data/pampax.db".to_string()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            storage_path: default_storage_path(),
            embedding: EmbeddingConfig::default(),
            rerank: RerankConfig::default(),
            cache: CacheConfig::default(),
            timeouts: TimeoutConfig::default(),
            limits: LimitConfig::default(),
            features: FeatureFlags::default(),
            tokenizer: TokenizerConfig::default(),
            indexer: IndexerConfig::default(),
            learning: LearningConfig::default(),
        }
    }
}

const KNOWN_KEYS: &[&str] = &[
    "storage_path",
    "embedding",
    "rerank",
    "cache",
    "timeouts",
    "limits",
    "features",
    "tokenizer",
    "indexer",
    "learning",
];

/// Load configuration with the documented precedence: built-in defaults,
/// then an optional `pampax.toml`, then `PAMPAX_`-prefixed environment
/// variables (nested keys separated with `__`). Unknown top-level keys are
/// reported and ignored.
pub fn get_config() -> Result<AppConfig, ConfigError> {
    let config = Config::builder()
        .add_source(File::with_name("pampax").required(false))
        .add_source(Environment::with_prefix("PAMPAX").separator("__"))
        .build()?;

    if let Ok(raw) = config.clone().try_deserialize::<serde_json::Map<String, serde_json::Value>>()
    {
        for key in raw.keys() {
            if !KNOWN_KEYS.contains(&key.as_str()) {
                warn!(key = %key, "Ignoring unknown configuration key");
            }
        }
    }

    config.try_deserialize()
}

impl AppConfig {
    /// Effective config as ordered JSON with secrets redacted, for
    /// `config show` / `config export`.
    pub fn to_redacted_json(&self) -> serde_json::Value {
        let mut value = serde_json::to_value(self).unwrap_or_default();
        for pointer in [
            "/embedding/api_key",
            "/rerank/cohere_api_key",
            "/rerank/voyage_api_key",
        ] {
            if let Some(slot) = value.pointer_mut(pointer) {
                if !slot.is_null() {
                    *slot = serde_json::Value::String("***".to_string());
                }
            }
        }
        value
    }

    /// Structural validation beyond what serde enforces.
    pub fn validate(&self) -> Result<(), String> {
        if self.storage_path.trim().is_empty() {
            return Err("storage_path must not be empty".to_string());
        }
        if self.tokenizer.default_chars_per_token <= 0.0 {
            return Err("tokenizer.default_chars_per_token must be positive".to_string());
        }
        if self.learning.learning_rate <= 0.0 || self.learning.learning_rate > 1.0 {
            return Err("learning.learning_rate must be in (0, 1]".to_string());
        }
        if self.limits.max_concurrent_external == 0 || self.limits.max_concurrent_expansions == 0 {
            return Err("limits.max_concurrent_* must be greater than zero".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.timeouts.search_ms, 5_000);
        assert_eq!(config.timeouts.generator_ms, 300);
        assert_eq!(config.cache.signature_max_size, 1000);
    }

    #[test]
    fn redaction_masks_secrets() {
        let mut config = AppConfig::default();
        config.embedding.api_key = Some("sk-very-secret".to_string());
        let json = config.to_redacted_json();
        assert_eq!(
            json.pointer("/embedding/api_key").and_then(|v| v.as_str()),
            Some("***")
        );
    }

    #[test]
    fn validation_rejects_zero_concurrency() {
        let mut config = AppConfig::default();
        config.limits.max_concurrent_external = 0;
        assert!(config.validate().is_err());
    }
}
