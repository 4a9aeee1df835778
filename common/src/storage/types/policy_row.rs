use std::collections::BTreeMap;

use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::storage::{db::SqliteStore, to_ts, StoreError};

/// The decision object governing one query: traversal depth, inclusion
/// flags, the early-stop ceiling, and per-source seed weights. The weight
/// map carries both generator-source keys (`fts`, `vector`, `memory`,
/// `symbol`, `graph`) and role keys (`definition`, `declaration`, ...)
/// consumed by the symbol generator and the packer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PolicyDecision {
    pub max_depth: u8,
    pub include_symbols: bool,
    pub include_files: bool,
    pub include_content: bool,
    pub early_stop_threshold: usize,
    pub seed_weights: BTreeMap<String, f32>,
}

impl PolicyDecision {
    pub fn weight(&self, key: &str) -> f32 {
        self.seed_weights.get(key).copied().unwrap_or(1.0)
    }
}

/// Record of the state a tuner write replaced, sufficient to restore it
/// exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PolicyRollback {
    pub repo: String,
    pub intent: String,
    /// `(version, decision)` before the write; `None` when the write
    /// created the row.
    pub previous: Option<(i64, PolicyDecision)>,
}

/// Repo-scoped persisted policy, versioned so tuner updates are atomic
/// and reversible.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyRow {
    pub repo: String,
    pub intent: String,
    pub version: i64,
    pub decision: PolicyDecision,
}

impl PolicyRow {
    pub async fn get(
        repo: &str,
        intent: &str,
        store: &SqliteStore,
    ) -> Result<Option<Self>, StoreError> {
        let repo = repo.to_owned();
        let intent = intent.to_owned();
        store
            .with_conn(move |conn| {
                let row = conn
                    .query_row(
                        "SELECT version, decision FROM policy_row
                         WHERE repo = ?1 AND intent = ?2",
                        params![repo, intent],
                        |row| {
                            let version: i64 = row.get(0)?;
                            let decision: String = row.get(1)?;
                            Ok((version, decision))
                        },
                    )
                    .optional()?;
                match row {
                    Some((version, decision)) => {
                        let decision = serde_json::from_str(&decision)
                            .map_err(|e| StoreError::Integrity(e.to_string()))?;
                        Ok(Some(Self {
                            repo,
                            intent,
                            version,
                            decision,
                        }))
                    }
                    None => Ok(None),
                }
            })
            .await
    }

    /// Write a new decision with an atomic version bump, returning the
    /// rollback record for the replaced state.
    pub async fn upsert_versioned(
        repo: &str,
        intent: &str,
        decision: PolicyDecision,
        store: &SqliteStore,
    ) -> Result<PolicyRollback, StoreError> {
        let repo = repo.to_owned();
        let intent = intent.to_owned();
        store
            .with_tx(move |tx| {
                let previous = tx
                    .query_row(
                        "SELECT version, decision FROM policy_row
                         WHERE repo = ?1 AND intent = ?2",
                        params![repo, intent],
                        |row| {
                            let version: i64 = row.get(0)?;
                            let decision: String = row.get(1)?;
                            Ok((version, decision))
                        },
                    )
                    .optional()?
                    .map(|(version, raw)| {
                        serde_json::from_str(&raw)
                            .map(|decision| (version, decision))
                            .map_err(|e| StoreError::Integrity(e.to_string()))
                    })
                    .transpose()?;

                let next_version = previous.as_ref().map_or(1, |(v, _)| v + 1);
                let encoded = serde_json::to_string(&decision)
                    .map_err(|e| StoreError::Integrity(e.to_string()))?;
                tx.execute(
                    "INSERT INTO policy_row (repo, intent, version, decision, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT (repo, intent) DO UPDATE SET
                         version = excluded.version,
                         decision = excluded.decision,
                         updated_at = excluded.updated_at",
                    params![repo, intent, next_version, encoded, to_ts(Utc::now())],
                )?;

                Ok(PolicyRollback {
                    repo,
                    intent,
                    previous,
                })
            })
            .await
    }

    /// Restore the exact pre-write state captured in `rollback`.
    pub async fn restore(
        rollback: PolicyRollback,
        store: &SqliteStore,
    ) -> Result<(), StoreError> {
        store
            .with_tx(move |tx| {
                match &rollback.previous {
                    Some((version, decision)) => {
                        let encoded = serde_json::to_string(decision)
                            .map_err(|e| StoreError::Integrity(e.to_string()))?;
                        tx.execute(
                            "INSERT INTO policy_row (repo, intent, version, decision, updated_at)
                             VALUES (?1, ?2, ?3, ?4, ?5)
                             ON CONFLICT (repo, intent) DO UPDATE SET
                                 version = excluded.version,
                                 decision = excluded.decision,
                                 updated_at = excluded.updated_at",
                            params![
                                rollback.repo,
                                rollback.intent,
                                version,
                                encoded,
                                to_ts(Utc::now()),
                            ],
                        )?;
                    }
                    None => {
                        tx.execute(
                            "DELETE FROM policy_row WHERE repo = ?1 AND intent = ?2",
                            params![rollback.repo, rollback.intent],
                        )?;
                    }
                }
                Ok(())
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decision(depth: u8) -> PolicyDecision {
        PolicyDecision {
            max_depth: depth,
            include_symbols: true,
            include_files: true,
            include_content: true,
            early_stop_threshold: 3,
            seed_weights: BTreeMap::from([("definition".to_string(), 2.0)]),
        }
    }

    #[tokio::test]
    async fn versions_bump_and_rollback_restores_exactly() {
        let store = SqliteStore::in_memory().expect("store");

        let first = PolicyRow::upsert_versioned("demo", "symbol", decision(2), &store)
            .await
            .expect("first write");
        assert!(first.previous.is_none());

        let second = PolicyRow::upsert_versioned("demo", "symbol", decision(3), &store)
            .await
            .expect("second write");
        let row = PolicyRow::get("demo", "symbol", &store)
            .await
            .expect("get")
            .expect("present");
        assert_eq!(row.version, 2);
        assert_eq!(row.decision.max_depth, 3);

        PolicyRow::restore(second, &store).await.expect("rollback");
        let restored = PolicyRow::get("demo", "symbol", &store)
            .await
            .expect("get")
            .expect("present");
        assert_eq!(restored.version, 1);
        assert_eq!(restored.decision, decision(2));
    }

    #[tokio::test]
    async fn rollback_of_a_creating_write_deletes_the_row() {
        let store = SqliteStore::in_memory().expect("store");
        let rollback = PolicyRow::upsert_versioned("demo", "api", decision(2), &store)
            .await
            .expect("write");
        PolicyRow::restore(rollback, &store).await.expect("rollback");
        assert!(PolicyRow::get("demo", "api", &store)
            .await
            .expect("get")
            .is_none());
    }
}
