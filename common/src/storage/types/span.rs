use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::{
    error::PampaxError,
    storage::{db::SqliteStore, parse_ts, to_ts, StoreError, StoredObject},
    utils::hash::{sha256_hex, sha256_hex_parts},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpanKind {
    Function,
    Method,
    Class,
    Interface,
    Variable,
    Constant,
    Type,
    Enum,
    Module,
    Import,
    Export,
}

impl SpanKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Function => "function",
            Self::Method => "method",
            Self::Class => "class",
            Self::Interface => "interface",
            Self::Variable => "variable",
            Self::Constant => "constant",
            Self::Type => "type",
            Self::Enum => "enum",
            Self::Module => "module",
            Self::Import => "import",
            Self::Export => "export",
        }
    }
}

impl fmt::Display for SpanKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SpanKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "function" => Ok(Self::Function),
            "method" => Ok(Self::Method),
            "class" => Ok(Self::Class),
            "interface" => Ok(Self::Interface),
            "variable" => Ok(Self::Variable),
            "constant" => Ok(Self::Constant),
            "type" => Ok(Self::Type),
            "enum" => Ok(Self::Enum),
            "module" => Ok(Self::Module),
            "import" => Ok(Self::Import),
            "export" => Ok(Self::Export),
            other => Err(format!("unknown span kind '{other}'")),
        }
    }
}

/// Input fields for a span; the id is derived, never supplied.
#[derive(Debug, Clone, Default)]
pub struct NewSpan<'a> {
    pub repo: &'a str,
    pub path: &'a str,
    pub byte_start: u64,
    pub byte_end: u64,
    pub kind: Option<SpanKind>,
    pub name: Option<&'a str>,
    pub signature: Option<&'a str>,
    pub doc: Option<&'a str>,
    pub parents: Vec<String>,
}

/// A contiguous source region with semantic identity. Identical content at
/// the identical location always derives the identical id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Span {
    pub span_id: String,
    pub repo: String,
    pub path: String,
    pub byte_start: u64,
    pub byte_end: u64,
    pub kind: SpanKind,
    pub name: Option<String>,
    pub signature: Option<String>,
    pub doc: Option<String>,
    pub parents: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

impl StoredObject for Span {
    fn table_name() -> &'static str {
        "span"
    }

    fn get_id(&self) -> &str {
        &self.span_id
    }
}

impl Span {
    pub fn new(draft: NewSpan<'_>) -> Result<Self, PampaxError> {
        if draft.byte_start >= draft.byte_end {
            return Err(PampaxError::InvalidInput(format!(
                "span range [{}, {}) is empty",
                draft.byte_start, draft.byte_end
            )));
        }
        let kind = draft.kind.ok_or_else(|| {
            PampaxError::InvalidInput("span kind is required".to_string())
        })?;

        let span_id = Self::compute_id(
            draft.repo,
            draft.path,
            draft.byte_start,
            draft.byte_end,
            kind,
            draft.name,
            draft.signature,
            draft.doc,
            &draft.parents,
        );

        Ok(Self {
            span_id,
            repo: draft.repo.to_owned(),
            path: draft.path.to_owned(),
            byte_start: draft.byte_start,
            byte_end: draft.byte_end,
            kind,
            name: draft.name.map(str::to_owned),
            signature: draft.signature.map(str::to_owned),
            doc: draft.doc.map(str::to_owned),
            parents: draft.parents,
            updated_at: Utc::now(),
        })
    }

    /// SHA-256 over
    /// `repo|path|byte_start|byte_end|kind|name|signature|hash(doc)|hash(parents)`.
    #[allow(clippy::too_many_arguments)]
    fn compute_id(
        repo: &str,
        path: &str,
        byte_start: u64,
        byte_end: u64,
        kind: SpanKind,
        name: Option<&str>,
        signature: Option<&str>,
        doc: Option<&str>,
        parents: &[String],
    ) -> String {
        let start = byte_start.to_string();
        let end = byte_end.to_string();
        let doc_hash = sha256_hex(doc.unwrap_or(""));
        let parents_hash = sha256_hex(&parents.join(","));
        sha256_hex_parts(&[
            repo,
            path,
            &start,
            &end,
            kind.as_str(),
            name.unwrap_or(""),
            signature.unwrap_or(""),
            &doc_hash,
            &parents_hash,
        ])
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let kind: String = row.get("kind")?;
        let parents: String = row.get("parents")?;
        let updated_at: String = row.get("updated_at")?;
        Ok(Self {
            span_id: row.get("span_id")?,
            repo: row.get("repo")?,
            path: row.get("path")?,
            byte_start: row.get("byte_start")?,
            byte_end: row.get("byte_end")?,
            kind: kind.parse().map_err(|e: String| {
                rusqlite::Error::FromSqlConversionFailure(
                    0,
                    rusqlite::types::Type::Text,
                    e.into(),
                )
            })?,
            name: row.get("name")?,
            signature: row.get("signature")?,
            doc: row.get("doc")?,
            parents: serde_json::from_str(&parents).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    0,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            })?,
            updated_at: parse_ts(&updated_at)?,
        })
    }

    fn bind_upsert(&self, conn: &rusqlite::Connection) -> Result<(), StoreError> {
        let parents = serde_json::to_string(&self.parents)
            .map_err(|e| StoreError::Integrity(e.to_string()))?;
        conn.execute(
            "INSERT INTO span
                 (span_id, repo, path, byte_start, byte_end, kind, name, signature, doc,
                  parents, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT (span_id) DO UPDATE SET updated_at = excluded.updated_at",
            params![
                self.span_id,
                self.repo,
                self.path,
                self.byte_start,
                self.byte_end,
                self.kind.as_str(),
                self.name,
                self.signature,
                self.doc,
                parents,
                to_ts(self.updated_at),
            ],
        )?;
        Ok(())
    }

    pub async fn upsert(&self, store: &SqliteStore) -> Result<(), StoreError> {
        let span = self.clone();
        store.with_write(move |conn| span.bind_upsert(conn)).await
    }

    /// Insert many spans in one transaction.
    pub async fn bulk_upsert(spans: Vec<Span>, store: &SqliteStore) -> Result<usize, StoreError> {
        let count = spans.len();
        store
            .with_tx(move |tx| {
                for span in &spans {
                    span.bind_upsert(tx)?;
                }
                Ok(count)
            })
            .await
    }

    pub async fn by_id(id: &str, store: &SqliteStore) -> Result<Option<Self>, StoreError> {
        let id = id.to_owned();
        store
            .with_conn(move |conn| {
                let span = conn
                    .query_row("SELECT * FROM span WHERE span_id = ?1", params![id], |row| {
                        Self::from_row(row)
                    })
                    .optional()?;
                Ok(span)
            })
            .await
    }

    pub async fn by_path(
        repo: &str,
        path: &str,
        store: &SqliteStore,
    ) -> Result<Vec<Self>, StoreError> {
        let repo = repo.to_owned();
        let path = path.to_owned();
        store
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT * FROM span WHERE repo = ?1 AND path = ?2 ORDER BY byte_start",
                )?;
                let rows = stmt
                    .query_map(params![repo, path], |row| Self::from_row(row))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    /// Spans overlapping `[start, end)` at the given location.
    pub async fn by_range(
        repo: &str,
        path: &str,
        start: u64,
        end: u64,
        store: &SqliteStore,
    ) -> Result<Vec<Self>, StoreError> {
        let repo = repo.to_owned();
        let path = path.to_owned();
        store
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT * FROM span
                     WHERE repo = ?1 AND path = ?2
                       AND byte_start < ?4 AND byte_end > ?3
                     ORDER BY byte_start",
                )?;
                let rows = stmt
                    .query_map(params![repo, path, start, end], |row| Self::from_row(row))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    /// Name lookup used by the symbol generator. Exact matches first, then
    /// (optionally) case-insensitive substring matches.
    pub async fn by_name(
        name: &str,
        repo: Option<&str>,
        fuzzy: bool,
        limit: usize,
        store: &SqliteStore,
    ) -> Result<Vec<Self>, StoreError> {
        let name = name.to_owned();
        let repo = repo.map(str::to_owned);
        store
            .with_conn(move |conn| {
                let mut out = Vec::new();
                let mut seen = std::collections::HashSet::new();

                let exact_sql = match repo {
                    Some(_) => {
                        "SELECT * FROM span WHERE name = ?1 AND repo = ?2 LIMIT ?3"
                    }
                    None => "SELECT * FROM span WHERE name = ?1 LIMIT ?2",
                };
                let mut stmt = conn.prepare(exact_sql)?;
                let exact: Vec<Span> = match &repo {
                    Some(repo) => stmt
                        .query_map(params![name, repo, limit as i64], |row| Self::from_row(row))?
                        .collect::<Result<Vec<_>, _>>()?,
                    None => stmt
                        .query_map(params![name, limit as i64], |row| Self::from_row(row))?
                        .collect::<Result<Vec<_>, _>>()?,
                };
                for span in exact {
                    if seen.insert(span.span_id.clone()) {
                        out.push(span);
                    }
                }

                if fuzzy && out.len() < limit {
                    let pattern = format!("%{name}%");
                    let fuzzy_sql = match repo {
                        Some(_) => {
                            "SELECT * FROM span
                             WHERE name LIKE ?1 COLLATE NOCASE AND repo = ?2 LIMIT ?3"
                        }
                        None => "SELECT * FROM span WHERE name LIKE ?1 COLLATE NOCASE LIMIT ?2",
                    };
                    let mut stmt = conn.prepare(fuzzy_sql)?;
                    let close: Vec<Span> = match &repo {
                        Some(repo) => stmt
                            .query_map(params![pattern, repo, limit as i64], |row| {
                                Self::from_row(row)
                            })?
                            .collect::<Result<Vec<_>, _>>()?,
                        None => stmt
                            .query_map(params![pattern, limit as i64], |row| Self::from_row(row))?
                            .collect::<Result<Vec<_>, _>>()?,
                    };
                    for span in close {
                        if out.len() >= limit {
                            break;
                        }
                        if seen.insert(span.span_id.clone()) {
                            out.push(span);
                        }
                    }
                }

                Ok(out)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft<'a>(name: &'a str) -> NewSpan<'a> {
        NewSpan {
            repo: "demo",
            path: "src/user.py",
            byte_start: 10,
            byte_end: 120,
            kind: Some(SpanKind::Function),
            name: Some(name),
            signature: Some("def get_user_by_id(id):"),
            doc: Some("Fetch a user."),
            parents: vec!["module:user".to_string()],
        }
    }

    #[test]
    fn ids_are_deterministic_across_constructions() {
        let a = Span::new(draft("get_user_by_id")).expect("span a");
        let b = Span::new(draft("get_user_by_id")).expect("span b");
        assert_eq!(a.span_id, b.span_id);

        let c = Span::new(draft("other_name")).expect("span c");
        assert_ne!(a.span_id, c.span_id, "name participates in the id");
    }

    #[test]
    fn empty_ranges_are_rejected() {
        let mut bad = draft("x");
        bad.byte_end = bad.byte_start;
        assert!(Span::new(bad).is_err());
    }

    #[tokio::test]
    async fn upsert_and_lookup_round_trip() {
        let store = SqliteStore::in_memory().expect("store");
        let span = Span::new(draft("get_user_by_id")).expect("span");
        span.upsert(&store).await.expect("upsert");

        let fetched = Span::by_id(&span.span_id, &store)
            .await
            .expect("by_id")
            .expect("present");
        assert_eq!(fetched.name.as_deref(), Some("get_user_by_id"));
        assert_eq!(fetched.parents, vec!["module:user".to_string()]);

        let by_path = Span::by_path("demo", "src/user.py", &store)
            .await
            .expect("by_path");
        assert_eq!(by_path.len(), 1);

        let by_range = Span::by_range("demo", "src/user.py", 100, 200, &store)
            .await
            .expect("by_range");
        assert_eq!(by_range.len(), 1, "overlapping range should match");

        let miss = Span::by_range("demo", "src/user.py", 200, 300, &store)
            .await
            .expect("by_range miss");
        assert!(miss.is_empty());
    }

    #[tokio::test]
    async fn by_name_prefers_exact_then_fuzzy() {
        let store = SqliteStore::in_memory().expect("store");
        let exact = Span::new(draft("get_user_by_id")).expect("span");
        let mut other = draft("get_user_by_id_cached");
        other.byte_start = 200;
        other.byte_end = 320;
        let fuzzy = Span::new(other).expect("span");
        Span::bulk_upsert(vec![exact.clone(), fuzzy.clone()], &store)
            .await
            .expect("bulk upsert");

        let hits = Span::by_name("get_user_by_id", Some("demo"), true, 10, &store)
            .await
            .expect("by_name");
        assert_eq!(hits.len(), 2);
        assert_eq!(hits.first().map(|s| s.span_id.as_str()), Some(exact.span_id.as_str()));
    }
}
