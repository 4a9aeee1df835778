use serde::Serialize;

use common::storage::types::policy_row::PolicyRollback;

use crate::{
    outcome::SatisfactionReport,
    tuner::{PolicyUpdate, WeightUpdate},
};

/// Result of one learn batch, including everything needed to undo it.
#[derive(Debug, Clone, Serialize)]
pub struct LearningReport {
    pub from_days: i64,
    pub signals: usize,
    pub metrics: SatisfactionReport,
    pub weight_updates: Vec<WeightUpdate>,
    pub policy_updates: Vec<PolicyUpdate>,
    /// Rollback records for every policy row this run replaced.
    pub rollbacks: Vec<PolicyRollback>,
    pub applied: bool,
    pub dry_run: bool,
}
