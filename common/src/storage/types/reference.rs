use std::{fmt, str::FromStr};

use rusqlite::{params_from_iter, types::Value, Row};
use serde::{Deserialize, Serialize};

use crate::storage::{db::SqliteStore, StoreError};

use super::span::Span;

/// Code-edge kinds the graph expander walks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EdgeKind {
    Call,
    Import,
    TestOf,
    Routes,
    ConfigKey,
}

impl EdgeKind {
    pub const ALL: [EdgeKind; 5] = [
        EdgeKind::Call,
        EdgeKind::Import,
        EdgeKind::TestOf,
        EdgeKind::Routes,
        EdgeKind::ConfigKey,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Call => "call",
            Self::Import => "import",
            Self::TestOf => "test-of",
            Self::Routes => "routes",
            Self::ConfigKey => "config-key",
        }
    }
}

impl fmt::Display for EdgeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EdgeKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "call" => Ok(Self::Call),
            "import" => Ok(Self::Import),
            "test-of" => Ok(Self::TestOf),
            "routes" => Ok(Self::Routes),
            "config-key" => Ok(Self::ConfigKey),
            other => Err(format!("unknown edge kind '{other}'")),
        }
    }
}

/// Directed relation from a source span to a destination byte range. The
/// destination is a location, not a span id, so edges survive re-indexing
/// of the destination file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Reference {
    pub src_span_id: String,
    pub dst_path: String,
    pub byte_start: u64,
    pub byte_end: u64,
    pub kind: EdgeKind,
    pub confidence: f32,
}

impl Reference {
    pub fn new(
        src_span_id: &str,
        dst_path: &str,
        byte_start: u64,
        byte_end: u64,
        kind: EdgeKind,
    ) -> Self {
        Self {
            src_span_id: src_span_id.to_owned(),
            dst_path: dst_path.to_owned(),
            byte_start,
            byte_end,
            kind,
            confidence: 1.0,
        }
    }

    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }

    fn from_row_prefixed(row: &Row<'_>) -> rusqlite::Result<Self> {
        let kind: String = row.get("kind")?;
        Ok(Self {
            src_span_id: row.get("src_span_id")?,
            dst_path: row.get("dst_path")?,
            byte_start: row.get("byte_start")?,
            byte_end: row.get("byte_end")?,
            kind: kind.parse().map_err(|e: String| {
                rusqlite::Error::FromSqlConversionFailure(
                    0,
                    rusqlite::types::Type::Text,
                    e.into(),
                )
            })?,
            confidence: row.get::<_, f64>("confidence")? as f32,
        })
    }

    pub async fn bulk_insert(
        references: Vec<Reference>,
        store: &SqliteStore,
    ) -> Result<usize, StoreError> {
        let count = references.len();
        store
            .with_tx(move |tx| {
                for reference in &references {
                    tx.execute(
                        "INSERT INTO reference
                             (src_span_id, dst_path, byte_start, byte_end, kind, confidence)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                         ON CONFLICT (src_span_id, dst_path, byte_start, byte_end, kind)
                         DO UPDATE SET confidence = excluded.confidence",
                        rusqlite::params![
                            reference.src_span_id,
                            reference.dst_path,
                            reference.byte_start,
                            reference.byte_end,
                            reference.kind.as_str(),
                            f64::from(reference.confidence),
                        ],
                    )?;
                }
                Ok(count)
            })
            .await
    }

    /// Edges leaving `span_id`, each with the destination span resolved by
    /// byte-range overlap when one exists.
    pub async fn outgoing(
        span_id: &str,
        kinds: Option<&[EdgeKind]>,
        store: &SqliteStore,
    ) -> Result<Vec<(Reference, Option<Span>)>, StoreError> {
        let span_id = span_id.to_owned();
        let kinds = kind_list(kinds);
        store
            .with_conn(move |conn| {
                let mut values: Vec<Value> = vec![Value::Text(span_id)];
                let kind_clause = in_clause(&kinds, &mut values, "r.kind");
                let sql = format!(
                    "SELECT r.src_span_id, r.dst_path, r.byte_start, r.byte_end, r.kind,
                            r.confidence, s2.span_id AS dst_span_id
                     FROM reference r
                     JOIN span s1 ON s1.span_id = r.src_span_id
                     LEFT JOIN span s2
                        ON s2.repo = s1.repo AND s2.path = r.dst_path
                       AND s2.byte_start < r.byte_end AND s2.byte_end > r.byte_start
                     WHERE r.src_span_id = ?1{kind_clause}
                     ORDER BY r.confidence DESC, r.dst_path, r.byte_start"
                );

                let mut stmt = conn.prepare(&sql)?;
                let pairs: Vec<(Reference, Option<String>)> = stmt
                    .query_map(params_from_iter(values), |row| {
                        let reference = Self::from_row_prefixed(row)?;
                        let dst: Option<String> = row.get("dst_span_id")?;
                        Ok((reference, dst))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;

                let mut out = Vec::with_capacity(pairs.len());
                for (reference, dst_span_id) in pairs {
                    let span = match dst_span_id {
                        Some(id) => conn
                            .query_row(
                                "SELECT * FROM span WHERE span_id = ?1",
                                rusqlite::params![id],
                                span_from_row,
                            )
                            .ok(),
                        None => None,
                    };
                    out.push((reference, span));
                }
                Ok(out)
            })
            .await
    }

    /// Edges arriving at `span_id`: references whose destination range
    /// overlaps the span, paired with their source span.
    pub async fn incoming(
        span_id: &str,
        kinds: Option<&[EdgeKind]>,
        store: &SqliteStore,
    ) -> Result<Vec<(Reference, Span)>, StoreError> {
        let span_id = span_id.to_owned();
        let kinds = kind_list(kinds);
        store
            .with_conn(move |conn| {
                let mut values: Vec<Value> = vec![Value::Text(span_id)];
                let kind_clause = in_clause(&kinds, &mut values, "r.kind");
                let sql = format!(
                    "SELECT r.src_span_id, r.dst_path, r.byte_start, r.byte_end, r.kind,
                            r.confidence,
                            s1.span_id, s1.repo, s1.path, s1.byte_start AS s_start,
                            s1.byte_end AS s_end, s1.kind AS s_kind, s1.name, s1.signature,
                            s1.doc, s1.parents, s1.updated_at
                     FROM reference r
                     JOIN span s1 ON s1.span_id = r.src_span_id
                     JOIN span t ON t.span_id = ?1
                     WHERE r.dst_path = t.path AND s1.repo = t.repo
                       AND r.byte_start < t.byte_end AND r.byte_end > t.byte_start{kind_clause}
                     ORDER BY r.confidence DESC, r.src_span_id"
                );

                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(params_from_iter(values), |row| {
                        let reference = Self::from_row_prefixed(row)?;
                        let span = span_from_aliased_row(row)?;
                        Ok((reference, span))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    /// Edges from `src_span_id` landing inside `dst_span_id`.
    pub async fn between(
        src_span_id: &str,
        dst_span_id: &str,
        kinds: Option<&[EdgeKind]>,
        store: &SqliteStore,
    ) -> Result<Vec<Reference>, StoreError> {
        let src = src_span_id.to_owned();
        let dst = dst_span_id.to_owned();
        let kinds = kind_list(kinds);
        store
            .with_conn(move |conn| {
                let mut values: Vec<Value> = vec![Value::Text(src), Value::Text(dst)];
                let kind_clause = in_clause(&kinds, &mut values, "r.kind");
                let sql = format!(
                    "SELECT r.src_span_id, r.dst_path, r.byte_start, r.byte_end, r.kind,
                            r.confidence
                     FROM reference r
                     JOIN span t ON t.span_id = ?2
                     WHERE r.src_span_id = ?1
                       AND r.dst_path = t.path
                       AND r.byte_start < t.byte_end AND r.byte_end > t.byte_start{kind_clause}"
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(params_from_iter(values), |row| Self::from_row_prefixed(row))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }
}

fn kind_list(kinds: Option<&[EdgeKind]>) -> Vec<String> {
    kinds
        .map(|list| list.iter().map(|k| k.as_str().to_owned()).collect())
        .unwrap_or_default()
}

/// Append `AND <column> IN (...)` when kinds were requested.
fn in_clause(kinds: &[String], values: &mut Vec<Value>, column: &str) -> String {
    if kinds.is_empty() {
        return String::new();
    }
    let mut placeholders = Vec::with_capacity(kinds.len());
    for kind in kinds {
        values.push(Value::Text(kind.clone()));
        placeholders.push(format!("?{}", values.len()));
    }
    format!(" AND {column} IN ({})", placeholders.join(", "))
}

fn span_from_row(row: &Row<'_>) -> rusqlite::Result<Span> {
    let kind: String = row.get("kind")?;
    let parents: String = row.get("parents")?;
    let updated_at: String = row.get("updated_at")?;
    Ok(Span {
        span_id: row.get("span_id")?,
        repo: row.get("repo")?,
        path: row.get("path")?,
        byte_start: row.get("byte_start")?,
        byte_end: row.get("byte_end")?,
        kind: parse_span_kind(&kind)?,
        name: row.get("name")?,
        signature: row.get("signature")?,
        doc: row.get("doc")?,
        parents: parse_parents(&parents)?,
        updated_at: crate::storage::parse_ts(&updated_at)?,
    })
}

/// Variant for queries that alias the span columns to avoid collisions
/// with the reference columns.
fn span_from_aliased_row(row: &Row<'_>) -> rusqlite::Result<Span> {
    let kind: String = row.get("s_kind")?;
    let parents: String = row.get("parents")?;
    let updated_at: String = row.get("updated_at")?;
    Ok(Span {
        span_id: row.get("span_id")?,
        repo: row.get("repo")?,
        path: row.get("path")?,
        byte_start: row.get("s_start")?,
        byte_end: row.get("s_end")?,
        kind: parse_span_kind(&kind)?,
        name: row.get("name")?,
        signature: row.get("signature")?,
        doc: row.get("doc")?,
        parents: parse_parents(&parents)?,
        updated_at: crate::storage::parse_ts(&updated_at)?,
    })
}

fn parse_span_kind(value: &str) -> rusqlite::Result<super::span::SpanKind> {
    value.parse().map_err(|e: String| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, e.into())
    })
}

fn parse_parents(value: &str) -> rusqlite::Result<Vec<String>> {
    serde_json::from_str(value).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}
