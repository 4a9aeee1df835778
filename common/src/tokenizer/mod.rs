use std::{
    collections::HashMap,
    num::NonZeroUsize,
    sync::{Arc, Mutex},
};

use lru::LruCache;
use serde::{Deserialize, Serialize};
use tokenizers::Tokenizer;
use tracing::{debug, warn};

use crate::{utils::config::TokenizerConfig, utils::hash::sha256_hex};

/// One logical model family: id prefixes it claims, its context window,
/// and the calibrated char-per-token ratio used when no real tokenizer is
/// available.
#[derive(Debug, Clone, Copy)]
pub struct ModelFamily {
    pub key: &'static str,
    pub prefixes: &'static [&'static str],
    pub context_window: usize,
    pub chars_per_token: f32,
}

/// Matched longest-prefix-first; the generic fallback is appended by
/// `family_for` when nothing matches.
const FAMILIES: &[ModelFamily] = &[
    ModelFamily { key: "gpt-4o", prefixes: &["gpt-4o"], context_window: 128_000, chars_per_token: 3.7 },
    ModelFamily { key: "gpt-4-turbo", prefixes: &["gpt-4-turbo", "gpt-4-1106", "gpt-4-0125"], context_window: 128_000, chars_per_token: 3.7 },
    ModelFamily { key: "gpt-4", prefixes: &["gpt-4"], context_window: 8_192, chars_per_token: 3.7 },
    ModelFamily { key: "gpt-3.5", prefixes: &["gpt-3.5"], context_window: 16_385, chars_per_token: 4.0 },
    ModelFamily { key: "o1", prefixes: &["o1-", "o1"], context_window: 200_000, chars_per_token: 3.7 },
    ModelFamily { key: "claude-3", prefixes: &["claude-3", "claude-sonnet", "claude-opus", "claude-haiku"], context_window: 200_000, chars_per_token: 3.5 },
    ModelFamily { key: "claude-2", prefixes: &["claude-2", "claude-instant"], context_window: 100_000, chars_per_token: 3.5 },
    ModelFamily { key: "gemini-1.5", prefixes: &["gemini-1.5"], context_window: 1_000_000, chars_per_token: 4.0 },
    ModelFamily { key: "gemini", prefixes: &["gemini"], context_window: 32_000, chars_per_token: 4.0 },
    ModelFamily { key: "llama-3", prefixes: &["llama-3", "meta-llama-3"], context_window: 8_192, chars_per_token: 3.8 },
    ModelFamily { key: "llama-2", prefixes: &["llama-2", "meta-llama-2"], context_window: 4_096, chars_per_token: 3.8 },
    ModelFamily { key: "mistral", prefixes: &["mistral"], context_window: 32_000, chars_per_token: 3.8 },
    ModelFamily { key: "mixtral", prefixes: &["mixtral"], context_window: 32_000, chars_per_token: 3.8 },
    ModelFamily { key: "qwen", prefixes: &["qwen"], context_window: 32_000, chars_per_token: 3.6 },
    ModelFamily { key: "deepseek", prefixes: &["deepseek"], context_window: 64_000, chars_per_token: 3.6 },
];

const GENERIC: ModelFamily = ModelFamily {
    key: "generic",
    prefixes: &[],
    context_window: 8_192,
    chars_per_token: 3.8,
};

/// Counting result. `estimated` is true when the char-ratio fallback was
/// used instead of a real tokenizer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenCount {
    pub count: usize,
    pub model_id: String,
    pub context_window: usize,
    pub estimated: bool,
}

/// Model-aware token counting with a bounded LRU result cache keyed by
/// `(model family, sha256(text))`. Families with a configured
/// `tokenizer.json` load a HuggingFace tokenizer lazily; everything else
/// estimates with the family's char ratio.
pub struct TokenizerFactory {
    config: TokenizerConfig,
    loaded: Mutex<HashMap<String, Option<Arc<Tokenizer>>>>,
    counts: Mutex<LruCache<(String, String), usize>>,
}

impl TokenizerFactory {
    pub fn new(config: TokenizerConfig, cache_entries: usize) -> Self {
        let capacity = NonZeroUsize::new(cache_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            config,
            loaded: Mutex::new(HashMap::new()),
            counts: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn family_for(model_id: &str) -> &'static ModelFamily {
        let lowered = model_id.to_ascii_lowercase();
        FAMILIES
            .iter()
            .find(|family| family.prefixes.iter().any(|p| lowered.starts_with(p)))
            .unwrap_or(&GENERIC)
    }

    /// Count tokens for `text` under `model_id`. Never fails: a broken or
    /// missing tokenizer degrades to the estimate path.
    pub fn count(&self, model_id: &str, text: &str) -> TokenCount {
        let family = Self::family_for(model_id);
        let cache_key = (family.key.to_owned(), sha256_hex(text));

        if let Ok(mut counts) = self.counts.lock() {
            if let Some(&count) = counts.get(&cache_key) {
                return TokenCount {
                    count,
                    model_id: model_id.to_owned(),
                    context_window: family.context_window,
                    // Cached exact and estimated counts are not
                    // distinguished; re-derive the flag from availability.
                    estimated: !self.has_tokenizer(family.key),
                };
            }
        }

        let (count, estimated) = match self.tokenizer_for(family.key) {
            Some(tokenizer) => match tokenizer.encode(text, false) {
                Ok(encoding) => (encoding.get_ids().len(), false),
                Err(err) => {
                    warn!(family = family.key, error = %err, "Tokenizer encode failed; estimating");
                    (self.estimate(family, text), true)
                }
            },
            None => (self.estimate(family, text), true),
        };

        if let Ok(mut counts) = self.counts.lock() {
            counts.put(cache_key, count);
        }

        TokenCount {
            count,
            model_id: model_id.to_owned(),
            context_window: family.context_window,
            estimated,
        }
    }

    fn estimate(&self, family: &ModelFamily, text: &str) -> usize {
        let ratio = if family.key == GENERIC.key {
            self.config.default_chars_per_token
        } else {
            family.chars_per_token
        };
        let chars = text.chars().count();
        ((chars as f32 / ratio).ceil() as usize).max(usize::from(!text.is_empty()))
    }

    fn has_tokenizer(&self, family_key: &str) -> bool {
        self.loaded
            .lock()
            .map(|loaded| matches!(loaded.get(family_key), Some(Some(_))))
            .unwrap_or(false)
    }

    fn tokenizer_for(&self, family_key: &str) -> Option<Arc<Tokenizer>> {
        let mut loaded = self.loaded.lock().ok()?;
        if let Some(entry) = loaded.get(family_key) {
            return entry.clone();
        }

        let entry = self.config.files.get(family_key).and_then(|path| {
            match Tokenizer::from_file(path) {
                Ok(tokenizer) => {
                    debug!(family = family_key, path = %path, "Loaded tokenizer");
                    Some(Arc::new(tokenizer))
                }
                Err(err) => {
                    warn!(family = family_key, path = %path, error = %err, "Failed to load tokenizer");
                    None
                }
            }
        });
        loaded.insert(family_key.to_owned(), entry.clone());
        entry
    }
}
