use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::storage::{db::SqliteStore, parse_ts, to_ts, StoreError};

/// One indexed file. `(repo, path)` is unique; `content_hash` is the
/// SHA-256 of the file bytes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileRecord {
    pub repo: String,
    pub path: String,
    pub content_hash: String,
    pub lang: Option<String>,
    pub indexed_at: DateTime<Utc>,
}

impl FileRecord {
    pub fn new(repo: &str, path: &str, content_hash: &str, lang: Option<&str>) -> Self {
        Self {
            repo: repo.to_owned(),
            path: path.to_owned(),
            content_hash: content_hash.to_owned(),
            lang: lang.map(str::to_owned),
            indexed_at: Utc::now(),
        }
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let indexed_at: String = row.get("indexed_at")?;
        Ok(Self {
            repo: row.get("repo")?,
            path: row.get("path")?,
            content_hash: row.get("content_hash")?,
            lang: row.get("lang")?,
            indexed_at: parse_ts(&indexed_at)?,
        })
    }

    pub async fn upsert(&self, store: &SqliteStore) -> Result<(), StoreError> {
        let record = self.clone();
        store
            .with_write(move |conn| {
                conn.execute(
                    "INSERT INTO file (repo, path, content_hash, lang, indexed_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT (repo, path) DO UPDATE SET
                         content_hash = excluded.content_hash,
                         lang = excluded.lang,
                         indexed_at = excluded.indexed_at",
                    params![
                        record.repo,
                        record.path,
                        record.content_hash,
                        record.lang,
                        to_ts(record.indexed_at),
                    ],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn get(
        repo: &str,
        path: &str,
        store: &SqliteStore,
    ) -> Result<Option<Self>, StoreError> {
        let repo = repo.to_owned();
        let path = path.to_owned();
        store
            .with_conn(move |conn| {
                let record = conn
                    .query_row(
                        "SELECT * FROM file WHERE repo = ?1 AND path = ?2",
                        params![repo, path],
                        |row| Self::from_row(row),
                    )
                    .optional()?;
                Ok(record)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upsert_replaces_hash_and_lang() {
        let store = SqliteStore::in_memory().expect("store");
        FileRecord::new("demo", "src/a.py", "hash-1", Some("python"))
            .upsert(&store)
            .await
            .expect("insert");
        FileRecord::new("demo", "src/a.py", "hash-2", Some("python"))
            .upsert(&store)
            .await
            .expect("update");

        let record = FileRecord::get("demo", "src/a.py", &store)
            .await
            .expect("get")
            .expect("present");
        assert_eq!(record.content_hash, "hash-2");
    }
}
