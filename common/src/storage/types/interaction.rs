use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Row};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::storage::{db::SqliteStore, parse_ts, to_ts, StoreError};

/// One recorded retrieval exchange, the raw material for the learn path.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Interaction {
    pub id: String,
    pub session_id: String,
    pub query: String,
    pub intent: String,
    pub bundle_signature: String,
    pub top_click: Option<String>,
    pub satisfied: Option<bool>,
    pub time_to_fix_ms: Option<u64>,
    pub token_usage: u64,
    pub seed_weights: BTreeMap<String, f32>,
    pub policy_thresholds: PolicyThresholds,
    pub language: Option<String>,
    pub repo: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// The tunable thresholds in force when the interaction ran.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct PolicyThresholds {
    pub max_depth: u8,
    pub early_stop_threshold: usize,
}

impl Interaction {
    pub fn new(
        session_id: &str,
        query: &str,
        intent: &str,
        bundle_signature: &str,
        token_usage: u64,
        seed_weights: BTreeMap<String, f32>,
        policy_thresholds: PolicyThresholds,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_owned(),
            query: query.to_owned(),
            intent: intent.to_owned(),
            bundle_signature: bundle_signature.to_owned(),
            top_click: None,
            satisfied: None,
            time_to_fix_ms: None,
            token_usage,
            seed_weights,
            policy_thresholds,
            language: None,
            repo: None,
            created_at: Utc::now(),
        }
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let seed_weights: String = row.get("seed_weights")?;
        let policy_thresholds: String = row.get("policy_thresholds")?;
        let created_at: String = row.get("created_at")?;
        let json_err = |e: serde_json::Error| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        };
        Ok(Self {
            id: row.get("id")?,
            session_id: row.get("session_id")?,
            query: row.get("query")?,
            intent: row.get("intent")?,
            bundle_signature: row.get("bundle_signature")?,
            top_click: row.get("top_click")?,
            satisfied: row
                .get::<_, Option<i64>>("satisfied")?
                .map(|value| value != 0),
            time_to_fix_ms: row
                .get::<_, Option<i64>>("time_to_fix_ms")?
                .map(|value| value.max(0) as u64),
            token_usage: row.get::<_, i64>("token_usage")?.max(0) as u64,
            seed_weights: serde_json::from_str(&seed_weights).map_err(json_err)?,
            policy_thresholds: serde_json::from_str(&policy_thresholds).map_err(json_err)?,
            language: row.get("language")?,
            repo: row.get("repo")?,
            created_at: parse_ts(&created_at)?,
        })
    }

    pub async fn record(&self, store: &SqliteStore) -> Result<(), StoreError> {
        let interaction = self.clone();
        store
            .with_write(move |conn| {
                let seed_weights = serde_json::to_string(&interaction.seed_weights)
                    .map_err(|e| StoreError::Integrity(e.to_string()))?;
                let thresholds = serde_json::to_string(&interaction.policy_thresholds)
                    .map_err(|e| StoreError::Integrity(e.to_string()))?;
                conn.execute(
                    "INSERT INTO interactions
                         (id, session_id, query, intent, bundle_signature, top_click,
                          satisfied, time_to_fix_ms, token_usage, seed_weights,
                          policy_thresholds, language, repo, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                    params![
                        interaction.id,
                        interaction.session_id,
                        interaction.query,
                        interaction.intent,
                        interaction.bundle_signature,
                        interaction.top_click,
                        interaction.satisfied.map(i64::from),
                        interaction.time_to_fix_ms.map(|v| v as i64),
                        interaction.token_usage as i64,
                        seed_weights,
                        thresholds,
                        interaction.language,
                        interaction.repo,
                        to_ts(interaction.created_at),
                    ],
                )?;
                Ok(())
            })
            .await
    }

    /// Attach an outcome observed after the bundle was used.
    pub async fn mark_outcome(
        id: &str,
        top_click: Option<&str>,
        satisfied: Option<bool>,
        time_to_fix_ms: Option<u64>,
        store: &SqliteStore,
    ) -> Result<(), StoreError> {
        let id = id.to_owned();
        let top_click = top_click.map(str::to_owned);
        store
            .with_write(move |conn| {
                let updated = conn.execute(
                    "UPDATE interactions
                     SET top_click = COALESCE(?2, top_click),
                         satisfied = COALESCE(?3, satisfied),
                         time_to_fix_ms = COALESCE(?4, time_to_fix_ms)
                     WHERE id = ?1",
                    params![
                        id,
                        top_click,
                        satisfied.map(i64::from),
                        time_to_fix_ms.map(|v| v as i64),
                    ],
                )?;
                if updated == 0 {
                    return Err(StoreError::NotFound(format!("interaction {id}")));
                }
                Ok(())
            })
            .await
    }

    /// Interactions from the trailing window, optionally per intent.
    pub async fn since(
        days: i64,
        intent: Option<&str>,
        store: &SqliteStore,
    ) -> Result<Vec<Self>, StoreError> {
        let cutoff = to_ts(Utc::now() - Duration::days(days));
        let intent = intent.map(str::to_owned);
        store
            .with_conn(move |conn| {
                let rows = match intent {
                    Some(intent) => {
                        let mut stmt = conn.prepare(
                            "SELECT * FROM interactions
                             WHERE created_at >= ?1 AND intent = ?2
                             ORDER BY created_at",
                        )?;
                        let rows = stmt
                            .query_map(params![cutoff, intent], |row| Self::from_row(row))?
                            .collect::<Result<Vec<_>, _>>()?;
                        rows
                    }
                    None => {
                        let mut stmt = conn.prepare(
                            "SELECT * FROM interactions
                             WHERE created_at >= ?1
                             ORDER BY created_at",
                        )?;
                        let rows = stmt
                            .query_map(params![cutoff], |row| Self::from_row(row))?
                            .collect::<Result<Vec<_>, _>>()?;
                        rows
                    }
                };
                Ok(rows)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::types::session::Session;

    fn weights() -> BTreeMap<String, f32> {
        BTreeMap::from([("fts".to_string(), 1.0), ("vector".to_string(), 1.2)])
    }

    #[tokio::test]
    async fn record_and_read_back_preserves_json_columns() {
        let store = SqliteStore::in_memory().expect("store");
        Session::ensure("s1", &store).await.expect("session");

        let interaction = Interaction::new(
            "s1",
            "getUserById function",
            "symbol",
            "sig-abc",
            1800,
            weights(),
            PolicyThresholds {
                max_depth: 2,
                early_stop_threshold: 3,
            },
        );
        interaction.record(&store).await.expect("record");

        let rows = Interaction::since(1, Some("symbol"), &store)
            .await
            .expect("since");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].seed_weights, weights());
        assert_eq!(rows[0].policy_thresholds.early_stop_threshold, 3);
    }

    #[tokio::test]
    async fn outcomes_update_in_place() {
        let store = SqliteStore::in_memory().expect("store");
        Session::ensure("s1", &store).await.expect("session");

        let interaction = Interaction::new(
            "s1",
            "q",
            "search",
            "sig",
            100,
            weights(),
            PolicyThresholds {
                max_depth: 2,
                early_stop_threshold: 10,
            },
        );
        interaction.record(&store).await.expect("record");

        Interaction::mark_outcome(&interaction.id, Some("chunk-1"), Some(true), Some(42_000), &store)
            .await
            .expect("mark outcome");

        let rows = Interaction::since(1, None, &store).await.expect("since");
        assert_eq!(rows[0].top_click.as_deref(), Some("chunk-1"));
        assert_eq!(rows[0].satisfied, Some(true));
        assert_eq!(rows[0].time_to_fix_ms, Some(42_000));
    }
}
