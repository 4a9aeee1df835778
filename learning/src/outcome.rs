use std::collections::BTreeMap;

use serde::Serialize;
use tracing::debug;

use common::{
    error::PampaxError,
    storage::{
        db::SqliteStore,
        types::interaction::{Interaction, PolicyThresholds},
    },
};

/// Per-interaction learning record derived from the raw row.
#[derive(Debug, Clone, Serialize)]
pub struct OutcomeSignal {
    pub interaction_id: String,
    pub intent: String,
    pub bundle_signature: String,
    pub satisfied: bool,
    pub token_usage: u64,
    pub time_to_fix_ms: Option<u64>,
    pub seed_weights: BTreeMap<String, f32>,
    pub thresholds: PolicyThresholds,
    pub language: Option<String>,
    pub repo: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct SatisfactionMetrics {
    pub interactions: usize,
    pub satisfied: usize,
    pub rate: f32,
    pub avg_time_to_fix_ms: Option<f64>,
    pub avg_tokens: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SatisfactionReport {
    pub overall: SatisfactionMetrics,
    pub per_intent: BTreeMap<String, SatisfactionMetrics>,
    pub per_signature: BTreeMap<String, SatisfactionMetrics>,
    pub per_language: BTreeMap<String, SatisfactionMetrics>,
    pub per_repo: BTreeMap<String, SatisfactionMetrics>,
}

/// Turns interaction rows into `OutcomeSignal`s and aggregates them.
pub struct OutcomeAnalyzer {
    /// A fix faster than this counts as satisfied even without a click.
    pub satisfied_fix_threshold_ms: u64,
}

impl OutcomeAnalyzer {
    pub async fn analyze(
        &self,
        store: &SqliteStore,
        from_days: i64,
    ) -> Result<Vec<OutcomeSignal>, PampaxError> {
        let interactions = Interaction::since(from_days, None, store).await?;
        debug!(rows = interactions.len(), from_days, "Analyzing interactions");
        Ok(interactions
            .into_iter()
            .map(|row| self.signal_for(row))
            .collect())
    }

    fn signal_for(&self, row: Interaction) -> OutcomeSignal {
        let fast_fix = row
            .time_to_fix_ms
            .map(|ms| ms < self.satisfied_fix_threshold_ms)
            .unwrap_or(false);
        let satisfied = row.satisfied.unwrap_or(false) || row.top_click.is_some() || fast_fix;

        OutcomeSignal {
            interaction_id: row.id,
            intent: row.intent,
            bundle_signature: row.bundle_signature,
            satisfied,
            token_usage: row.token_usage,
            time_to_fix_ms: row.time_to_fix_ms,
            seed_weights: row.seed_weights,
            thresholds: row.policy_thresholds,
            language: row.language,
            repo: row.repo,
        }
    }

    pub fn metrics(signals: &[OutcomeSignal]) -> SatisfactionReport {
        let mut report = SatisfactionReport {
            overall: aggregate(signals.iter()),
            ..SatisfactionReport::default()
        };

        let mut by_intent: BTreeMap<String, Vec<&OutcomeSignal>> = BTreeMap::new();
        let mut by_signature: BTreeMap<String, Vec<&OutcomeSignal>> = BTreeMap::new();
        let mut by_language: BTreeMap<String, Vec<&OutcomeSignal>> = BTreeMap::new();
        let mut by_repo: BTreeMap<String, Vec<&OutcomeSignal>> = BTreeMap::new();

        for signal in signals {
            by_intent.entry(signal.intent.clone()).or_default().push(signal);
            by_signature
                .entry(signal.bundle_signature.clone())
                .or_default()
                .push(signal);
            if let Some(language) = &signal.language {
                by_language.entry(language.clone()).or_default().push(signal);
            }
            if let Some(repo) = &signal.repo {
                by_repo.entry(repo.clone()).or_default().push(signal);
            }
        }

        report.per_intent = by_intent
            .into_iter()
            .map(|(key, group)| (key, aggregate(group.into_iter())))
            .collect();
        report.per_signature = by_signature
            .into_iter()
            .map(|(key, group)| (key, aggregate(group.into_iter())))
            .collect();
        report.per_language = by_language
            .into_iter()
            .map(|(key, group)| (key, aggregate(group.into_iter())))
            .collect();
        report.per_repo = by_repo
            .into_iter()
            .map(|(key, group)| (key, aggregate(group.into_iter())))
            .collect();
        report
    }
}

fn aggregate<'a>(signals: impl Iterator<Item = &'a OutcomeSignal>) -> SatisfactionMetrics {
    let mut interactions = 0usize;
    let mut satisfied = 0usize;
    let mut token_sum = 0u64;
    let mut fix_sum = 0u64;
    let mut fix_count = 0usize;

    for signal in signals {
        interactions += 1;
        if signal.satisfied {
            satisfied += 1;
        }
        token_sum += signal.token_usage;
        if let Some(fix) = signal.time_to_fix_ms {
            fix_sum += fix;
            fix_count += 1;
        }
    }

    SatisfactionMetrics {
        interactions,
        satisfied,
        rate: if interactions == 0 {
            0.0
        } else {
            satisfied as f32 / interactions as f32
        },
        avg_time_to_fix_ms: if fix_count == 0 {
            None
        } else {
            Some(fix_sum as f64 / fix_count as f64)
        },
        avg_tokens: if interactions == 0 {
            0.0
        } else {
            token_sum as f64 / interactions as f64
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::storage::types::session::Session;

    fn weights(definition: f32) -> BTreeMap<String, f32> {
        BTreeMap::from([("definition".to_string(), definition)])
    }

    async fn record(
        store: &SqliteStore,
        intent: &str,
        satisfied: Option<bool>,
        time_to_fix_ms: Option<u64>,
        definition_weight: f32,
    ) {
        let mut interaction = Interaction::new(
            "s1",
            "q",
            intent,
            "sig",
            1000,
            weights(definition_weight),
            PolicyThresholds {
                max_depth: 2,
                early_stop_threshold: 3,
            },
        );
        interaction.satisfied = satisfied;
        interaction.time_to_fix_ms = time_to_fix_ms;
        interaction.record(store).await.expect("record");
    }

    #[tokio::test]
    async fn fast_fixes_count_as_satisfied() {
        let store = SqliteStore::in_memory().expect("store");
        Session::ensure("s1", &store).await.expect("session");

        record(&store, "symbol", None, Some(60_000), 2.0).await;
        record(&store, "symbol", None, Some(900_000), 2.0).await;
        record(&store, "symbol", Some(true), None, 2.0).await;

        let analyzer = OutcomeAnalyzer {
            satisfied_fix_threshold_ms: 300_000,
        };
        let signals = analyzer.analyze(&store, 7).await.expect("analyze");
        assert_eq!(signals.len(), 3);
        assert_eq!(signals.iter().filter(|s| s.satisfied).count(), 2);
    }

    #[tokio::test]
    async fn metrics_aggregate_per_intent() {
        let store = SqliteStore::in_memory().expect("store");
        Session::ensure("s1", &store).await.expect("session");

        record(&store, "symbol", Some(true), Some(10_000), 2.0).await;
        record(&store, "symbol", Some(false), None, 2.0).await;
        record(&store, "config", Some(true), None, 2.0).await;

        let analyzer = OutcomeAnalyzer {
            satisfied_fix_threshold_ms: 300_000,
        };
        let signals = analyzer.analyze(&store, 7).await.expect("analyze");
        let report = OutcomeAnalyzer::metrics(&signals);

        assert_eq!(report.overall.interactions, 3);
        let symbol = report.per_intent.get("symbol").expect("symbol metrics");
        assert_eq!(symbol.interactions, 2);
        assert_eq!(symbol.satisfied, 1);
        assert!((symbol.rate - 0.5).abs() < 1e-6);
        assert_eq!(symbol.avg_time_to_fix_ms, Some(10_000.0));
    }
}
