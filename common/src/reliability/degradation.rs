use std::{collections::HashMap, sync::Mutex};

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::PampaxError;

/// Service levels derived from the aggregate health score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceLevel {
    Full,
    Degraded,
    Minimal,
    Emergency,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
    Primary,
    Cache,
    Fallback,
}

impl ServiceLevel {
    /// Strategies permitted at this level, in preference order.
    pub const fn permitted(self) -> &'static [StrategyKind] {
        match self {
            Self::Full => &[StrategyKind::Primary, StrategyKind::Cache, StrategyKind::Fallback],
            Self::Degraded => &[StrategyKind::Cache, StrategyKind::Primary, StrategyKind::Fallback],
            Self::Minimal => &[StrategyKind::Cache, StrategyKind::Fallback],
            Self::Emergency => &[StrategyKind::Cache],
        }
    }
}

/// Tracks per-component health in [0, 1] and executes work with the
/// strategy order the current level permits.
#[derive(Default)]
pub struct DegradationManager {
    components: Mutex<HashMap<String, f32>>,
}

impl DegradationManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn report_health(&self, component: &str, health: f32) {
        if let Ok(mut components) = self.components.lock() {
            components.insert(component.to_owned(), health.clamp(0.0, 1.0));
        }
    }

    /// Mean component health; 1.0 when nothing reported yet.
    pub fn health_score(&self) -> f32 {
        match self.components.lock() {
            Ok(components) if !components.is_empty() => {
                components.values().sum::<f32>() / components.len() as f32
            }
            _ => 1.0,
        }
    }

    pub fn level(&self) -> ServiceLevel {
        let score = self.health_score();
        if score >= 0.8 {
            ServiceLevel::Full
        } else if score >= 0.5 {
            ServiceLevel::Degraded
        } else if score >= 0.25 {
            ServiceLevel::Minimal
        } else {
            ServiceLevel::Emergency
        }
    }

    /// Try the supplied strategies in the order the current level permits
    /// and return the first success. Fails with the last error once every
    /// permitted strategy is spent.
    pub async fn execute<T>(
        &self,
        mut strategies: Vec<(StrategyKind, BoxFuture<'_, Result<T, PampaxError>>)>,
    ) -> Result<T, PampaxError> {
        let level = self.level();
        let mut last_error: Option<PampaxError> = None;

        for permitted in level.permitted() {
            let Some(position) = strategies.iter().position(|(kind, _)| kind == permitted) else {
                continue;
            };
            let (kind, fut) = strategies.remove(position);
            match fut.await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    warn!(strategy = ?kind, level = ?level, error = %err, "Strategy failed");
                    last_error = Some(err);
                }
            }
        }

        debug!(level = ?level, "All permitted strategies exhausted");
        Err(last_error.unwrap_or_else(|| {
            PampaxError::Exhausted(format!("no strategy permitted at level {level:?}"))
        }))
    }
}
