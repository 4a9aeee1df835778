//! Offline learn path: interactions → outcome signals → satisfaction
//! metrics → bounded weight/policy updates with rollback records.

pub mod outcome;
pub mod report;
pub mod tuner;

use std::collections::BTreeMap;

use tracing::{info, warn};

use common::{
    error::PampaxError,
    storage::{
        db::SqliteStore,
        types::{
            job_run::{JobRun, JobStatus},
            policy_row::{PolicyDecision, PolicyRow},
        },
    },
    utils::config::LearningConfig,
};
use retrieval_pipeline::policy::PolicyGate;

use outcome::{OutcomeAnalyzer, OutcomeSignal};
use report::LearningReport;
use tuner::{PolicyTuner, WeightTuner};

#[derive(Debug, Clone)]
pub struct LearnOptions {
    pub from_days: i64,
    pub update_weights: bool,
    pub dry_run: bool,
}

impl Default for LearnOptions {
    fn default() -> Self {
        Self {
            from_days: 30,
            update_weights: false,
            dry_run: false,
        }
    }
}

/// Run one learn batch. With `update_weights` and not `dry_run`, tuned
/// decisions are written as versioned policy rows and the report carries
/// rollback records that restore the exact pre-run state.
pub async fn run(
    store: &SqliteStore,
    config: &LearningConfig,
    options: LearnOptions,
) -> Result<LearningReport, PampaxError> {
    let job_id = JobRun::start("learn", store).await?;
    let result = run_inner(store, config, &options).await;

    match &result {
        Ok(report) => {
            info!(
                signals = report.signals,
                weight_updates = report.weight_updates.len(),
                applied = report.applied,
                "Learn batch complete"
            );
            JobRun::finish(job_id, JobStatus::Completed, None, store).await?;
        }
        Err(err) => {
            JobRun::finish(job_id, JobStatus::Failed, Some(&err.to_string()), store).await?;
        }
    }
    result
}

async fn run_inner(
    store: &SqliteStore,
    config: &LearningConfig,
    options: &LearnOptions,
) -> Result<LearningReport, PampaxError> {
    let analyzer = OutcomeAnalyzer {
        satisfied_fix_threshold_ms: config.satisfied_fix_threshold_ms,
    };
    let signals = analyzer.analyze(store, options.from_days).await?;
    let metrics = OutcomeAnalyzer::metrics(&signals);

    let weight_tuner = WeightTuner {
        learning_rate: config.learning_rate,
        conv_threshold: config.conv_threshold,
        max_iterations: config.max_iterations,
        min_signals: config.min_signals_per_intent,
    };
    let policy_tuner = PolicyTuner {
        min_signals: config.min_signals_per_intent,
    };

    // Tune per (repo, intent) group; `*` covers signals without a repo.
    let mut groups: BTreeMap<(String, String), Vec<&OutcomeSignal>> = BTreeMap::new();
    for signal in &signals {
        let repo = signal.repo.clone().unwrap_or_else(|| "*".to_string());
        groups
            .entry((repo, signal.intent.clone()))
            .or_default()
            .push(signal);
    }

    let mut report = LearningReport {
        from_days: options.from_days,
        signals: signals.len(),
        metrics,
        weight_updates: Vec::new(),
        policy_updates: Vec::new(),
        rollbacks: Vec::new(),
        applied: false,
        dry_run: options.dry_run,
    };

    for ((repo, intent), group) in &groups {
        if group.len() < config.min_signals_per_intent {
            continue;
        }

        let base_decision = match PolicyRow::get(repo, intent, store).await? {
            Some(row) => row.decision,
            None => match intent.parse() {
                Ok(parsed) => PolicyGate::default_for(parsed),
                Err(_) => {
                    warn!(intent = %intent, "Unknown intent in interactions; skipping");
                    continue;
                }
            },
        };

        let weight_update =
            weight_tuner.optimize(repo, intent, group, &base_decision.seed_weights);
        let policy_update = policy_tuner.optimize(
            intent,
            group,
            common::storage::types::interaction::PolicyThresholds {
                max_depth: base_decision.max_depth,
                early_stop_threshold: base_decision.early_stop_threshold,
            },
        );

        if options.update_weights && !options.dry_run {
            let mut decision = base_decision.clone();
            if let Some(update) = &weight_update {
                decision.seed_weights = update.after.clone();
            }
            if let Some(update) = &policy_update {
                decision.max_depth = update.after.max_depth;
                decision.early_stop_threshold = update.after.early_stop_threshold;
            }
            if weight_update.is_some() || policy_update.is_some() {
                validate_and_write(store, repo, intent, decision, &mut report).await?;
            }
        }

        report.weight_updates.extend(weight_update);
        report.policy_updates.extend(policy_update);
    }

    report.applied = options.update_weights && !options.dry_run && !report.rollbacks.is_empty();
    Ok(report)
}

async fn validate_and_write(
    store: &SqliteStore,
    repo: &str,
    intent: &str,
    decision: PolicyDecision,
    report: &mut LearningReport,
) -> Result<(), PampaxError> {
    retrieval_pipeline::policy::validate(&decision)?;
    let rollback = PolicyRow::upsert_versioned(repo, intent, decision, store).await?;
    report.rollbacks.push(rollback);
    Ok(())
}

/// Undo a previous learn application using its rollback records.
pub async fn rollback(
    store: &SqliteStore,
    rollbacks: Vec<common::storage::types::policy_row::PolicyRollback>,
) -> Result<usize, PampaxError> {
    let count = rollbacks.len();
    for record in rollbacks {
        PolicyRow::restore(record, store).await?;
    }
    Ok(count)
}
