//! Full learn-cycle behavior: interactions in, tuned policy rows out, and
//! exact restoration on rollback.

use std::collections::BTreeMap;

use common::storage::{
    db::SqliteStore,
    types::{
        interaction::{Interaction, PolicyThresholds},
        policy_row::PolicyRow,
        session::Session,
    },
};
use common::utils::config::LearningConfig;

use learning::{outcome::OutcomeAnalyzer, rollback, run, LearnOptions};
use retrieval_pipeline::{intent::Intent, policy::PolicyGate};

fn weights(definition: f32) -> BTreeMap<String, f32> {
    let mut base = PolicyGate::default_for(Intent::Symbol).seed_weights;
    base.insert("definition".to_string(), definition);
    base
}

async fn seed_interactions(store: &SqliteStore, count: usize) {
    Session::ensure("s1", store).await.expect("session");
    for i in 0..count {
        // Clicks favor bundles produced with a higher definition weight.
        let (definition, satisfied) = if i % 2 == 0 { (2.5, true) } else { (1.5, false) };
        let mut interaction = Interaction::new(
            "s1",
            "getUserById function",
            "symbol",
            "sig-learn",
            1500,
            weights(definition),
            PolicyThresholds {
                max_depth: 2,
                early_stop_threshold: 3,
            },
        );
        interaction.satisfied = Some(satisfied);
        if satisfied {
            interaction.top_click = Some("chunk-top".to_string());
            interaction.time_to_fix_ms = Some(45_000);
        } else {
            interaction.time_to_fix_ms = Some(700_000);
        }
        interaction.record(store).await.expect("record");
    }
}

#[tokio::test]
async fn learn_raises_the_definition_weight_within_bounds() {
    let store = SqliteStore::in_memory().expect("store");
    seed_interactions(&store, 60).await;

    let report = run(
        &store,
        &LearningConfig::default(),
        LearnOptions {
            from_days: 30,
            update_weights: true,
            dry_run: false,
        },
    )
    .await
    .expect("learn run");

    assert!(report.applied);
    let update = report
        .weight_updates
        .iter()
        .find(|u| u.intent == "symbol")
        .expect("symbol update");
    let before = update.before.get("definition").copied().expect("before");
    let after = update.after.get("definition").copied().expect("after");
    assert!(after > before, "definition weight increased: {before} -> {after}");
    assert!(after <= 5.0);
    for weight in update.after.values() {
        assert!((0.1..=5.0).contains(weight), "weight {weight} within bounds");
    }

    // The tuned decision is live in the policy row.
    let row = PolicyRow::get("*", "symbol", &store)
        .await
        .expect("get")
        .expect("row written");
    assert_eq!(row.decision.seed_weights, update.after);

    // Offline replay: the tuned weights score the held-out satisfied
    // cluster at least as well as the base weights did.
    let analyzer = OutcomeAnalyzer {
        satisfied_fix_threshold_ms: 300_000,
    };
    let signals = analyzer.analyze(&store, 30).await.expect("signals");
    let satisfied_definition_mean: f32 = {
        let satisfied: Vec<f32> = signals
            .iter()
            .filter(|s| s.satisfied)
            .filter_map(|s| s.seed_weights.get("definition").copied())
            .collect();
        satisfied.iter().sum::<f32>() / satisfied.len() as f32
    };
    assert!(
        (after - satisfied_definition_mean).abs() < (before - satisfied_definition_mean).abs(),
        "tuned weight moved toward the satisfied cluster"
    );
}

#[tokio::test]
async fn rollback_restores_pre_run_weights_exactly() {
    let store = SqliteStore::in_memory().expect("store");
    seed_interactions(&store, 40).await;

    // Pre-seed a policy row so the run replaces (not creates) it.
    let pre = PolicyGate::default_for(Intent::Symbol);
    PolicyRow::upsert_versioned("*", "symbol", pre.clone(), &store)
        .await
        .expect("pre-seed");
    let before_run = PolicyRow::get("*", "symbol", &store)
        .await
        .expect("get")
        .expect("row");

    let report = run(
        &store,
        &LearningConfig::default(),
        LearnOptions {
            from_days: 30,
            update_weights: true,
            dry_run: false,
        },
    )
    .await
    .expect("learn run");
    assert!(report.applied);

    let tuned = PolicyRow::get("*", "symbol", &store)
        .await
        .expect("get")
        .expect("row");
    assert_ne!(tuned.decision.seed_weights, before_run.decision.seed_weights);

    let restored_count = rollback(&store, report.rollbacks)
        .await
        .expect("rollback");
    assert!(restored_count >= 1);

    let restored = PolicyRow::get("*", "symbol", &store)
        .await
        .expect("get")
        .expect("row");
    assert_eq!(
        restored.decision.seed_weights, before_run.decision.seed_weights,
        "weights match pre-run values exactly"
    );
    assert_eq!(restored.version, before_run.version);
}

#[tokio::test]
async fn dry_runs_report_without_writing() {
    let store = SqliteStore::in_memory().expect("store");
    seed_interactions(&store, 40).await;

    let report = run(
        &store,
        &LearningConfig::default(),
        LearnOptions {
            from_days: 30,
            update_weights: true,
            dry_run: true,
        },
    )
    .await
    .expect("learn run");

    assert!(!report.applied);
    assert!(!report.weight_updates.is_empty(), "updates are still computed");
    assert!(PolicyRow::get("*", "symbol", &store)
        .await
        .expect("get")
        .is_none());
}

#[tokio::test]
async fn below_min_signals_nothing_is_tuned() {
    let store = SqliteStore::in_memory().expect("store");
    seed_interactions(&store, 2).await;

    let report = run(
        &store,
        &LearningConfig::default(),
        LearnOptions {
            from_days: 30,
            update_weights: true,
            dry_run: false,
        },
    )
    .await
    .expect("learn run");

    assert!(report.weight_updates.is_empty());
    assert!(!report.applied);
}
