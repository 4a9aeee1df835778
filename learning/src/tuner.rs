use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use tracing::debug;

use common::storage::types::interaction::PolicyThresholds;
use retrieval_pipeline::policy::{EARLY_STOP_BOUNDS, MAX_DEPTH_BOUNDS, WEIGHT_BOUNDS};

use crate::outcome::OutcomeSignal;

#[derive(Debug, Clone, Serialize)]
pub struct WeightUpdate {
    pub repo: String,
    pub intent: String,
    pub before: BTreeMap<String, f32>,
    pub after: BTreeMap<String, f32>,
    pub iterations: usize,
    pub loss_before: f32,
    pub loss_after: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct PolicyUpdate {
    pub intent: String,
    pub before: PolicyThresholds,
    pub after: PolicyThresholds,
    pub objective_before: f32,
    pub objective_after: f32,
}

/// Gradient descent on `1 − satisfaction_rate` per intent. The loss is
/// made differentiable by kernel-weighting each interaction's outcome by
/// the distance between its recorded seed weights and the candidate
/// weights; central finite differences give the per-key gradient.
pub struct WeightTuner {
    pub learning_rate: f32,
    pub conv_threshold: f32,
    pub max_iterations: usize,
    pub min_signals: usize,
}

const FD_STEP: f32 = 0.05;
/// Kernel sharpness; larger means interactions further from the candidate
/// weights contribute less.
const KERNEL_SCALE: f32 = 2.0;

impl WeightTuner {
    pub fn optimize(
        &self,
        repo: &str,
        intent: &str,
        signals: &[&OutcomeSignal],
        base: &BTreeMap<String, f32>,
    ) -> Option<WeightUpdate> {
        if signals.len() < self.min_signals {
            debug!(intent, signals = signals.len(), "Too few signals; skipping");
            return None;
        }

        // Tune only the keys that actually vary across interactions; a key
        // with one observed value carries no gradient information.
        let keys: BTreeSet<String> = base
            .keys()
            .filter(|key| {
                let values: BTreeSet<String> = signals
                    .iter()
                    .filter_map(|s| s.seed_weights.get(*key))
                    .map(|w| format!("{w:.4}"))
                    .collect();
                values.len() > 1
            })
            .cloned()
            .collect();
        if keys.is_empty() {
            return None;
        }

        let mut weights = base.clone();
        let loss_before = loss(&weights, signals);
        let mut current_loss = loss_before;
        let mut iterations = 0usize;

        for _ in 0..self.max_iterations {
            iterations += 1;
            let mut next = weights.clone();
            for key in &keys {
                let center = weights.get(key).copied().unwrap_or(1.0);

                let mut plus = weights.clone();
                plus.insert(key.clone(), center + FD_STEP);
                let mut minus = weights.clone();
                minus.insert(key.clone(), (center - FD_STEP).max(WEIGHT_BOUNDS.0));

                let gradient = (loss(&plus, signals) - loss(&minus, signals)) / (2.0 * FD_STEP);
                let updated = (center - self.learning_rate * gradient)
                    .clamp(WEIGHT_BOUNDS.0, WEIGHT_BOUNDS.1);
                next.insert(key.clone(), updated);
            }

            let next_loss = loss(&next, signals);
            let improvement = current_loss - next_loss;
            weights = next;
            current_loss = next_loss;
            if improvement.abs() < self.conv_threshold {
                break;
            }
        }

        if weights == *base {
            return None;
        }

        Some(WeightUpdate {
            repo: repo.to_owned(),
            intent: intent.to_owned(),
            before: base.clone(),
            after: weights,
            iterations,
            loss_before,
            loss_after: current_loss,
        })
    }
}

/// `1 − kernel-weighted satisfaction rate` at the candidate weights.
fn loss(candidate: &BTreeMap<String, f32>, signals: &[&OutcomeSignal]) -> f32 {
    let mut weighted_satisfaction = 0.0f32;
    let mut total = 0.0f32;

    for signal in signals {
        let mut distance = 0.0f32;
        for (key, value) in candidate {
            let observed = signal.seed_weights.get(key).copied().unwrap_or(*value);
            let delta = value - observed;
            distance += delta * delta;
        }
        let kernel = (-KERNEL_SCALE * distance).exp();
        total += kernel;
        if signal.satisfied {
            weighted_satisfaction += kernel;
        }
    }

    if total <= f32::EPSILON {
        1.0
    } else {
        1.0 - weighted_satisfaction / total
    }
}

/// Bounded coordinate search over `(max_depth, early_stop_threshold)`
/// guided by observed time-to-fix and token usage.
pub struct PolicyTuner {
    pub min_signals: usize,
}

impl PolicyTuner {
    pub fn optimize(
        &self,
        intent: &str,
        signals: &[&OutcomeSignal],
        current: PolicyThresholds,
    ) -> Option<PolicyUpdate> {
        if signals.len() < self.min_signals {
            return None;
        }

        let mut depth_candidates: BTreeSet<u8> = signals
            .iter()
            .map(|s| s.thresholds.max_depth)
            .chain([current.max_depth])
            .collect();
        depth_candidates.retain(|d| (MAX_DEPTH_BOUNDS.0..=MAX_DEPTH_BOUNDS.1).contains(d));

        let mut early_candidates: BTreeSet<usize> = signals
            .iter()
            .map(|s| s.thresholds.early_stop_threshold)
            .chain([
                current.early_stop_threshold,
                (current.early_stop_threshold / 2).max(EARLY_STOP_BOUNDS.0),
                (current.early_stop_threshold * 2).min(EARLY_STOP_BOUNDS.1),
            ])
            .collect();
        early_candidates.retain(|e| (EARLY_STOP_BOUNDS.0..=EARLY_STOP_BOUNDS.1).contains(e));

        let objective_before = objective(current, signals);
        let mut best = current;
        let mut best_objective = objective_before;

        for depth in &depth_candidates {
            for early in &early_candidates {
                let candidate = PolicyThresholds {
                    max_depth: *depth,
                    early_stop_threshold: *early,
                };
                let score = objective(candidate, signals);
                if score < best_objective {
                    best = candidate;
                    best_objective = score;
                }
            }
        }

        if best == current {
            return None;
        }

        Some(PolicyUpdate {
            intent: intent.to_owned(),
            before: current,
            after: best,
            objective_before,
            objective_after: best_objective,
        })
    }
}

/// Kernel-weighted cost: dissatisfaction plus normalized time-to-fix and
/// token usage, weighted by how close each interaction's recorded
/// thresholds sit to the candidate.
fn objective(candidate: PolicyThresholds, signals: &[&OutcomeSignal]) -> f32 {
    let max_tokens = signals
        .iter()
        .map(|s| s.token_usage)
        .max()
        .unwrap_or(1)
        .max(1) as f32;
    let max_fix = signals
        .iter()
        .filter_map(|s| s.time_to_fix_ms)
        .max()
        .unwrap_or(1)
        .max(1) as f32;

    let mut cost_sum = 0.0f32;
    let mut weight_sum = 0.0f32;
    for signal in signals {
        let depth_delta =
            (f32::from(candidate.max_depth) - f32::from(signal.thresholds.max_depth)).abs();
        let early_delta = (candidate.early_stop_threshold as f32
            - signal.thresholds.early_stop_threshold as f32)
            .abs();
        let weight = 1.0 / (1.0 + depth_delta + early_delta);

        let mut cost = if signal.satisfied { 0.0 } else { 1.0 };
        cost += signal.token_usage as f32 / max_tokens * 0.3;
        if let Some(fix) = signal.time_to_fix_ms {
            cost += fix as f32 / max_fix * 0.3;
        }

        cost_sum += weight * cost;
        weight_sum += weight;
    }

    if weight_sum <= f32::EPSILON {
        f32::MAX
    } else {
        cost_sum / weight_sum
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signal(definition: f32, satisfied: bool, depth: u8, early: usize) -> OutcomeSignal {
        OutcomeSignal {
            interaction_id: format!("i-{definition}-{satisfied}"),
            intent: "symbol".to_string(),
            bundle_signature: "sig".to_string(),
            satisfied,
            token_usage: 1000,
            time_to_fix_ms: if satisfied { Some(30_000) } else { Some(600_000) },
            seed_weights: BTreeMap::from([
                ("definition".to_string(), definition),
                ("usage".to_string(), 1.0),
            ]),
            thresholds: PolicyThresholds {
                max_depth: depth,
                early_stop_threshold: early,
            },
            language: None,
            repo: None,
        }
    }

    fn tuner() -> WeightTuner {
        WeightTuner {
            learning_rate: 0.1,
            conv_threshold: 1e-3,
            max_iterations: 100,
            min_signals: 5,
        }
    }

    #[test]
    fn clicks_favoring_higher_definition_raise_the_weight() {
        // Satisfied outcomes cluster at definition=2.5, unsatisfied at 1.5.
        let mut signals = Vec::new();
        for _ in 0..30 {
            signals.push(signal(2.5, true, 2, 3));
            signals.push(signal(1.5, false, 2, 3));
        }
        let refs: Vec<&OutcomeSignal> = signals.iter().collect();
        let base = BTreeMap::from([
            ("definition".to_string(), 2.0f32),
            ("usage".to_string(), 1.0f32),
        ]);

        let update = tuner()
            .optimize("*", "symbol", &refs, &base)
            .expect("update produced");
        let after = update.after.get("definition").copied().expect("definition");
        assert!(after > 2.0, "definition weight should increase, got {after}");
        assert!(after <= WEIGHT_BOUNDS.1);
        assert!(update.loss_after <= update.loss_before);
        // Keys without variance stay untouched.
        assert_eq!(update.after.get("usage"), Some(&1.0));
    }

    #[test]
    fn too_few_signals_skip_tuning() {
        let signals = vec![signal(2.0, true, 2, 3)];
        let refs: Vec<&OutcomeSignal> = signals.iter().collect();
        let base = BTreeMap::from([("definition".to_string(), 2.0f32)]);
        assert!(tuner().optimize("*", "symbol", &refs, &base).is_none());
    }

    #[test]
    fn weights_stay_inside_bounds() {
        let mut signals = Vec::new();
        for _ in 0..50 {
            signals.push(signal(5.0, true, 2, 3));
            signals.push(signal(0.1, false, 2, 3));
        }
        let refs: Vec<&OutcomeSignal> = signals.iter().collect();
        let base = BTreeMap::from([("definition".to_string(), 4.9f32)]);

        if let Some(update) = tuner().optimize("*", "symbol", &refs, &base) {
            let after = update.after.get("definition").copied().expect("definition");
            assert!((WEIGHT_BOUNDS.0..=WEIGHT_BOUNDS.1).contains(&after));
        }
    }

    #[test]
    fn policy_tuner_moves_toward_satisfied_thresholds() {
        // Depth 3 / early 5 interactions succeed; depth 1 / early 2 fail.
        let mut signals = Vec::new();
        for _ in 0..20 {
            signals.push(signal(2.0, true, 3, 5));
            signals.push(signal(2.0, false, 1, 2));
        }
        let refs: Vec<&OutcomeSignal> = signals.iter().collect();

        let update = PolicyTuner { min_signals: 5 }
            .optimize(
                "symbol",
                &refs,
                PolicyThresholds {
                    max_depth: 1,
                    early_stop_threshold: 2,
                },
            )
            .expect("update");
        assert_eq!(update.after.max_depth, 3);
        assert_eq!(update.after.early_stop_threshold, 5);
        assert!(update.objective_after < update.objective_before);
    }
}
