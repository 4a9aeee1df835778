use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use tracing::debug;

use common::error::PampaxError;
pub use common::storage::types::policy_row::{PolicyDecision, PolicyRollback, PolicyRow};

use crate::intent::{Intent, IntentResult};

/// Context an operation supplies alongside the classified intent.
#[derive(Debug, Clone, Default)]
pub struct SearchContext {
    pub repo: Option<String>,
    pub language: Option<String>,
    pub query_length: usize,
    pub budget: Option<usize>,
}

/// Partial decision applied on top for a matching repository pattern.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyOverlay {
    pub max_depth: Option<u8>,
    pub early_stop_threshold: Option<usize>,
    pub include_symbols: Option<bool>,
    pub include_files: Option<bool>,
    pub include_content: Option<bool>,
    #[serde(default)]
    pub seed_weights: BTreeMap<String, f32>,
}

pub const MAX_DEPTH_BOUNDS: (u8, u8) = (1, 10);
pub const EARLY_STOP_BOUNDS: (usize, usize) = (1, 50);
pub const WEIGHT_BOUNDS: (f32, f32) = (0.1, 5.0);

/// Maps `(intent, context)` to a validated `PolicyDecision`: intent
/// defaults, then the deterministic adjustment sequence, then bounds
/// validation.
#[derive(Default)]
pub struct PolicyGate {
    /// Per-language multipliers applied to matching seed-weight keys.
    language_multipliers: HashMap<String, HashMap<String, f32>>,
    /// `(repo pattern, overlay)` applied last; `*` suffix matches prefixes.
    repo_overrides: Vec<(String, PolicyOverlay)>,
}

impl PolicyGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_language_multiplier(
        mut self,
        language: &str,
        weight_key: &str,
        multiplier: f32,
    ) -> Self {
        self.language_multipliers
            .entry(language.to_ascii_lowercase())
            .or_default()
            .insert(weight_key.to_owned(), multiplier);
        self
    }

    pub fn with_repo_override(mut self, pattern: &str, overlay: PolicyOverlay) -> Self {
        self.repo_overrides.push((pattern.to_owned(), overlay));
        self
    }

    /// Built-in decision for each intent; the learned, repo-scoped policy
    /// row replaces this as the base when one exists.
    pub fn default_for(intent: Intent) -> PolicyDecision {
        let source_defaults = [("fts", 1.0f32), ("vector", 1.0), ("memory", 1.0), ("symbol", 1.0), ("graph", 1.0)];
        let weights = |roles: &[(&str, f32)]| -> BTreeMap<String, f32> {
            source_defaults
                .iter()
                .map(|(k, v)| ((*k).to_owned(), *v))
                .chain(roles.iter().map(|(k, v)| ((*k).to_owned(), *v)))
                .collect()
        };

        match intent {
            Intent::Symbol => PolicyDecision {
                max_depth: 2,
                include_symbols: true,
                include_files: true,
                include_content: true,
                early_stop_threshold: 3,
                seed_weights: weights(&[
                    ("definition", 2.0),
                    ("declaration", 1.8),
                    ("implementation", 1.5),
                    ("usage", 1.0),
                    ("test", 0.8),
                    ("reference", 0.5),
                ]),
            },
            Intent::Config => PolicyDecision {
                max_depth: 1,
                include_symbols: false,
                include_files: true,
                include_content: true,
                early_stop_threshold: 2,
                seed_weights: {
                    let mut weights = weights(&[("definition", 0.8), ("reference", 1.0)]);
                    weights.insert("fts".to_owned(), 1.3);
                    weights.insert("symbol".to_owned(), 0.5);
                    weights
                },
            },
            Intent::Api => PolicyDecision {
                max_depth: 2,
                include_symbols: true,
                include_files: true,
                include_content: true,
                early_stop_threshold: 2,
                seed_weights: weights(&[
                    ("handler", 2.0),
                    ("endpoint", 1.8),
                    ("route", 1.6),
                    ("definition", 1.2),
                    ("usage", 1.0),
                ]),
            },
            Intent::Incident => PolicyDecision {
                max_depth: 3,
                include_symbols: true,
                include_files: true,
                include_content: true,
                early_stop_threshold: 5,
                seed_weights: weights(&[
                    ("error", 2.0),
                    ("exception", 1.8),
                    ("caller", 1.5),
                    ("test", 1.2),
                ]),
            },
            Intent::Search => PolicyDecision {
                max_depth: 2,
                include_symbols: true,
                include_files: true,
                include_content: true,
                early_stop_threshold: 10,
                seed_weights: weights(&[]),
            },
        }
    }

    /// Derive the decision for a query. `stored_base`, when present, is the
    /// learned repo-scoped policy row and replaces the built-in default.
    pub fn decide(
        &self,
        intent_result: &IntentResult,
        ctx: &SearchContext,
        stored_base: Option<PolicyDecision>,
    ) -> Result<PolicyDecision, PampaxError> {
        let mut decision =
            stored_base.unwrap_or_else(|| Self::default_for(intent_result.intent));

        // 1. Confidence.
        if intent_result.confidence > 0.8 {
            decision.max_depth = decision.max_depth.saturating_add(1);
            decision.early_stop_threshold =
                ((decision.early_stop_threshold as f32) * 1.5).round() as usize;
        } else if intent_result.confidence < 0.5 {
            decision.max_depth = 1;
            decision.early_stop_threshold = (decision.early_stop_threshold / 2).max(1);
        }

        // 2. Query length.
        if ctx.query_length < 10 {
            decision.max_depth = decision.max_depth.saturating_add(1);
        } else if ctx.query_length > 50 {
            decision.max_depth = decision.max_depth.saturating_sub(1).max(1);
        }

        // 3. Budget.
        if let Some(budget) = ctx.budget {
            if budget < 2000 {
                decision.include_content = false;
                decision.early_stop_threshold = (decision.early_stop_threshold / 2).max(1);
            }
        }

        // 4. Language multipliers.
        if let Some(language) = &ctx.language {
            if let Some(multipliers) = self.language_multipliers.get(&language.to_ascii_lowercase())
            {
                for (key, multiplier) in multipliers {
                    if let Some(weight) = decision.seed_weights.get_mut(key) {
                        *weight *= multiplier;
                    }
                }
            }
        }

        // 5. Repository overlay, last.
        if let Some(repo) = &ctx.repo {
            for (pattern, overlay) in &self.repo_overrides {
                if repo_matches(pattern, repo) {
                    apply_overlay(&mut decision, overlay);
                }
            }
        }

        clamp(&mut decision);
        validate(&decision)?;
        debug!(
            intent = %intent_result.intent,
            max_depth = decision.max_depth,
            early_stop = decision.early_stop_threshold,
            "Policy decided"
        );
        Ok(decision)
    }
}

fn repo_matches(pattern: &str, repo: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => repo.starts_with(prefix),
        None => repo == pattern,
    }
}

fn apply_overlay(decision: &mut PolicyDecision, overlay: &PolicyOverlay) {
    if let Some(depth) = overlay.max_depth {
        decision.max_depth = depth;
    }
    if let Some(threshold) = overlay.early_stop_threshold {
        decision.early_stop_threshold = threshold;
    }
    if let Some(flag) = overlay.include_symbols {
        decision.include_symbols = flag;
    }
    if let Some(flag) = overlay.include_files {
        decision.include_files = flag;
    }
    if let Some(flag) = overlay.include_content {
        decision.include_content = flag;
    }
    for (key, weight) in &overlay.seed_weights {
        decision.seed_weights.insert(key.clone(), *weight);
    }
}

fn clamp(decision: &mut PolicyDecision) {
    decision.max_depth = decision.max_depth.clamp(MAX_DEPTH_BOUNDS.0, MAX_DEPTH_BOUNDS.1);
    decision.early_stop_threshold = decision
        .early_stop_threshold
        .clamp(EARLY_STOP_BOUNDS.0, EARLY_STOP_BOUNDS.1);
    for weight in decision.seed_weights.values_mut() {
        *weight = weight.clamp(WEIGHT_BOUNDS.0, WEIGHT_BOUNDS.1);
    }
}

/// Reject a decision outside the documented bounds. Runs on every derived
/// decision and on rows loaded from the store.
pub fn validate(decision: &PolicyDecision) -> Result<(), PampaxError> {
    if !(MAX_DEPTH_BOUNDS.0..=MAX_DEPTH_BOUNDS.1).contains(&decision.max_depth) {
        return Err(PampaxError::InvalidInput(format!(
            "max_depth {} outside [{}, {}]",
            decision.max_depth, MAX_DEPTH_BOUNDS.0, MAX_DEPTH_BOUNDS.1
        )));
    }
    if !(EARLY_STOP_BOUNDS.0..=EARLY_STOP_BOUNDS.1).contains(&decision.early_stop_threshold) {
        return Err(PampaxError::InvalidInput(format!(
            "early_stop_threshold {} outside [{}, {}]",
            decision.early_stop_threshold, EARLY_STOP_BOUNDS.0, EARLY_STOP_BOUNDS.1
        )));
    }
    for (key, weight) in &decision.seed_weights {
        if !(WEIGHT_BOUNDS.0..=WEIGHT_BOUNDS.1).contains(weight) {
            return Err(PampaxError::InvalidInput(format!(
                "seed weight '{key}' = {weight} outside [{}, {}]",
                WEIGHT_BOUNDS.0, WEIGHT_BOUNDS.1
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intent::IntentResult;

    fn intent_result(intent: Intent, confidence: f32) -> IntentResult {
        IntentResult {
            intent,
            confidence,
            entities: Vec::new(),
            suggested_policies: Vec::new(),
        }
    }

    fn ctx(query_length: usize) -> SearchContext {
        SearchContext {
            query_length,
            ..SearchContext::default()
        }
    }

    #[test]
    fn intent_defaults_match_the_decision_table() {
        let symbol = PolicyGate::default_for(Intent::Symbol);
        assert_eq!(symbol.max_depth, 2);
        assert_eq!(symbol.early_stop_threshold, 3);
        assert_eq!(symbol.weight("definition"), 2.0);
        assert_eq!(symbol.weight("reference"), 0.5);

        let config = PolicyGate::default_for(Intent::Config);
        assert_eq!(config.max_depth, 1);
        assert!(!config.include_symbols);
        assert!(config.include_files);

        let incident = PolicyGate::default_for(Intent::Incident);
        assert_eq!(incident.max_depth, 3);
        assert_eq!(incident.early_stop_threshold, 5);
    }

    #[test]
    fn high_confidence_deepens_and_raises_the_ceiling() {
        let gate = PolicyGate::new();
        let decision = gate
            .decide(&intent_result(Intent::Symbol, 0.9), &ctx(25), None)
            .expect("decision");
        assert_eq!(decision.max_depth, 3);
        assert_eq!(decision.early_stop_threshold, 5); // round(3 * 1.5)
    }

    #[test]
    fn low_confidence_flattens_the_walk() {
        let gate = PolicyGate::new();
        let decision = gate
            .decide(&intent_result(Intent::Incident, 0.3), &ctx(25), None)
            .expect("decision");
        assert_eq!(decision.max_depth, 1);
        assert_eq!(decision.early_stop_threshold, 2);
    }

    #[test]
    fn tight_budgets_strip_content() {
        let gate = PolicyGate::new();
        let mut context = ctx(25);
        context.budget = Some(1500);
        let decision = gate
            .decide(&intent_result(Intent::Search, 0.6), &context, None)
            .expect("decision");
        assert!(!decision.include_content);
        assert_eq!(decision.early_stop_threshold, 5);
    }

    #[test]
    fn short_queries_deepen_long_queries_flatten() {
        let gate = PolicyGate::new();
        let deep = gate
            .decide(&intent_result(Intent::Symbol, 0.6), &ctx(5), None)
            .expect("decision");
        assert_eq!(deep.max_depth, 3);

        let shallow = gate
            .decide(&intent_result(Intent::Symbol, 0.6), &ctx(80), None)
            .expect("decision");
        assert_eq!(shallow.max_depth, 1);
    }

    #[test]
    fn repo_overlays_apply_last_and_results_stay_bounded() {
        let gate = PolicyGate::new().with_repo_override(
            "acme/*",
            PolicyOverlay {
                max_depth: Some(9),
                seed_weights: BTreeMap::from([("definition".to_string(), 99.0)]),
                ..PolicyOverlay::default()
            },
        );
        let mut context = ctx(25);
        context.repo = Some("acme/billing".to_string());
        let decision = gate
            .decide(&intent_result(Intent::Symbol, 0.6), &context, None)
            .expect("decision");
        assert_eq!(decision.max_depth, 9);
        assert_eq!(decision.weight("definition"), 5.0, "clamped to bounds");
        validate(&decision).expect("bounded decision validates");
    }

    #[test]
    fn language_multipliers_touch_matching_keys_only() {
        let gate = PolicyGate::new().with_language_multiplier("python", "test", 1.5);
        let mut context = ctx(25);
        context.language = Some("Python".to_string());
        let decision = gate
            .decide(&intent_result(Intent::Symbol, 0.6), &context, None)
            .expect("decision");
        assert!((decision.weight("test") - 1.2).abs() < 1e-6);
        assert_eq!(decision.weight("definition"), 2.0);
    }

    #[test]
    fn out_of_bounds_stored_rows_are_rejected() {
        let mut bad = PolicyGate::default_for(Intent::Search);
        bad.max_depth = 0;
        assert!(validate(&bad).is_err());
    }
}
