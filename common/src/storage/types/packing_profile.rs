use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::storage::{db::SqliteStore, to_ts, StoreError};

/// How to shorten an over-budget item when a capsule is not wanted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TruncationStrategy {
    Head,
    Tail,
    Middle,
    Smart,
}

/// Budget share per packing tier plus the held-back reserve. Shares are
/// fractions of the total token budget and should sum to at most 1.0.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct TierShares {
    pub must_have: f32,
    pub important: f32,
    pub supplementary: f32,
    pub optional: f32,
    pub reserve: f32,
}

impl Default for TierShares {
    fn default() -> Self {
        Self {
            must_have: 0.40,
            important: 0.25,
            supplementary: 0.15,
            optional: 0.10,
            reserve: 0.10,
        }
    }
}

/// Per-`(repo, model)` packing behavior: tier shares, content-kind
/// priorities, capsule cap, and the truncation strategy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PackingProfile {
    pub version: u32,
    pub tier_shares: TierShares,
    /// Relative priority per content kind (`code`, `tests`, `config`, ...).
    pub priorities: BTreeMap<String, f32>,
    pub capsule_max_tokens: usize,
    pub truncation: TruncationStrategy,
    pub ttl_seconds: Option<u64>,
}

impl Default for PackingProfile {
    fn default() -> Self {
        Self {
            version: 1,
            tier_shares: TierShares::default(),
            priorities: BTreeMap::from([
                ("code".to_string(), 1.0),
                ("tests".to_string(), 0.8),
                ("config".to_string(), 0.7),
                ("docs".to_string(), 0.6),
                ("examples".to_string(), 0.5),
                ("comments".to_string(), 0.4),
            ]),
            capsule_max_tokens: 120,
            truncation: TruncationStrategy::Smart,
            ttl_seconds: None,
        }
    }
}

impl PackingProfile {
    pub async fn get(
        repo: &str,
        model: &str,
        store: &SqliteStore,
    ) -> Result<Option<Self>, StoreError> {
        let repo = repo.to_owned();
        let model = model.to_owned();
        store
            .with_conn(move |conn| {
                let raw = conn
                    .query_row(
                        "SELECT profile FROM packing_profile WHERE repo = ?1 AND model = ?2",
                        params![repo, model],
                        |row| row.get::<_, String>(0),
                    )
                    .optional()?;
                raw.map(|json| {
                    serde_json::from_str(&json)
                        .map_err(|e| StoreError::Integrity(e.to_string()))
                })
                .transpose()
            })
            .await
    }

    pub async fn get_or_default(
        repo: &str,
        model: &str,
        store: &SqliteStore,
    ) -> Result<Self, StoreError> {
        Ok(Self::get(repo, model, store).await?.unwrap_or_default())
    }

    pub async fn upsert(
        &self,
        repo: &str,
        model: &str,
        store: &SqliteStore,
    ) -> Result<(), StoreError> {
        let repo = repo.to_owned();
        let model = model.to_owned();
        let profile = self.clone();
        store
            .with_write(move |conn| {
                let encoded = serde_json::to_string(&profile)
                    .map_err(|e| StoreError::Integrity(e.to_string()))?;
                conn.execute(
                    "INSERT INTO packing_profile
                         (repo, model, version, profile, ttl_seconds, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                     ON CONFLICT (repo, model) DO UPDATE SET
                         version = excluded.version,
                         profile = excluded.profile,
                         ttl_seconds = excluded.ttl_seconds,
                         updated_at = excluded.updated_at",
                    params![
                        repo,
                        model,
                        i64::from(profile.version),
                        encoded,
                        profile.ttl_seconds.map(|v| v as i64),
                        to_ts(Utc::now()),
                    ],
                )?;
                Ok(())
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_shares_leave_headroom() {
        let shares = TierShares::default();
        let total = shares.must_have
            + shares.important
            + shares.supplementary
            + shares.optional
            + shares.reserve;
        assert!((total - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn profile_round_trips_per_repo_and_model() {
        let store = SqliteStore::in_memory().expect("store");
        let mut profile = PackingProfile::default();
        profile.capsule_max_tokens = 200;
        profile
            .upsert("demo", "claude-3-sonnet", &store)
            .await
            .expect("upsert");

        let fetched = PackingProfile::get_or_default("demo", "claude-3-sonnet", &store)
            .await
            .expect("get");
        assert_eq!(fetched.capsule_max_tokens, 200);

        let fallback = PackingProfile::get_or_default("demo", "gpt-4o", &store)
            .await
            .expect("get default");
        assert_eq!(fallback, PackingProfile::default());
    }
}
