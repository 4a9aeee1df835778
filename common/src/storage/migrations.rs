use rusqlite::Connection;
use tracing::info;

use super::StoreError;

/// Ordered, append-only migration list. Each entry runs in its own
/// transaction and is recorded in `schema_migrations`.
pub const MIGRATIONS: &[(i64, &str)] = &[(1, SCHEMA_V1)];

const SCHEMA_V1: &str = r#"
CREATE TABLE file (
    repo         TEXT NOT NULL,
    path         TEXT NOT NULL,
    content_hash TEXT NOT NULL,
    lang         TEXT,
    indexed_at   TEXT NOT NULL,
    PRIMARY KEY (repo, path)
);

CREATE TABLE span (
    span_id    TEXT PRIMARY KEY,
    repo       TEXT NOT NULL,
    path       TEXT NOT NULL,
    byte_start INTEGER NOT NULL,
    byte_end   INTEGER NOT NULL,
    kind       TEXT NOT NULL,
    name       TEXT,
    signature  TEXT,
    doc        TEXT,
    parents    TEXT NOT NULL DEFAULT '[]',
    updated_at TEXT NOT NULL,
    CHECK (byte_start < byte_end)
);
CREATE INDEX span_location_idx ON span (repo, path, byte_start);
CREATE INDEX span_name_idx ON span (name);

CREATE TABLE chunk (
    chunk_id   TEXT PRIMARY KEY,
    span_id    TEXT NOT NULL REFERENCES span (span_id) ON DELETE CASCADE,
    repo       TEXT NOT NULL,
    path       TEXT NOT NULL,
    content    TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX chunk_span_idx ON chunk (span_id);

CREATE VIRTUAL TABLE chunk_fts USING fts5(
    content,
    content='chunk',
    content_rowid='rowid',
    tokenize='porter unicode61'
);

CREATE TRIGGER chunk_fts_after_insert AFTER INSERT ON chunk BEGIN
    INSERT INTO chunk_fts (rowid, content) VALUES (new.rowid, new.content);
END;
CREATE TRIGGER chunk_fts_after_delete AFTER DELETE ON chunk BEGIN
    INSERT INTO chunk_fts (chunk_fts, rowid, content)
    VALUES ('delete', old.rowid, old.content);
END;
CREATE TRIGGER chunk_fts_after_update AFTER UPDATE ON chunk BEGIN
    INSERT INTO chunk_fts (chunk_fts, rowid, content)
    VALUES ('delete', old.rowid, old.content);
    INSERT INTO chunk_fts (rowid, content) VALUES (new.rowid, new.content);
END;

CREATE TABLE embedding (
    chunk_id   TEXT NOT NULL REFERENCES chunk (chunk_id) ON DELETE CASCADE,
    model      TEXT NOT NULL,
    dim        INTEGER NOT NULL,
    vector     BLOB NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (chunk_id, model)
);

CREATE TABLE reference (
    src_span_id TEXT NOT NULL REFERENCES span (span_id) ON DELETE CASCADE,
    dst_path    TEXT NOT NULL,
    byte_start  INTEGER NOT NULL,
    byte_end    INTEGER NOT NULL,
    kind        TEXT NOT NULL,
    confidence  REAL NOT NULL DEFAULT 1.0,
    PRIMARY KEY (src_span_id, dst_path, byte_start, byte_end, kind)
);
CREATE INDEX reference_dst_idx ON reference (dst_path, byte_start);

CREATE TABLE job_run (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    kind        TEXT NOT NULL,
    status      TEXT NOT NULL,
    error       TEXT,
    started_at  TEXT NOT NULL,
    finished_at TEXT
);

CREATE TABLE rerank_cache (
    cache_key  TEXT PRIMARY KEY,
    provider   TEXT NOT NULL,
    model      TEXT,
    ranking    TEXT NOT NULL,
    created_at TEXT NOT NULL,
    expires_at TEXT NOT NULL
);

CREATE TABLE search_log (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    query        TEXT NOT NULL,
    intent       TEXT NOT NULL,
    duration_ms  INTEGER NOT NULL,
    result_count INTEGER NOT NULL,
    created_at   TEXT NOT NULL
);

CREATE TABLE sessions (
    session_id     TEXT PRIMARY KEY,
    created_at     TEXT NOT NULL,
    last_active_at TEXT NOT NULL,
    metadata       TEXT
);

CREATE TABLE memory_items (
    id         TEXT PRIMARY KEY,
    session_id TEXT NOT NULL REFERENCES sessions (session_id) ON DELETE CASCADE,
    kind       TEXT NOT NULL,
    key        TEXT,
    content    TEXT NOT NULL,
    metadata   TEXT,
    created_at TEXT NOT NULL,
    expires_at TEXT,
    pinned     INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX memory_session_idx ON memory_items (session_id);

CREATE TABLE memory_links (
    memory_id  TEXT NOT NULL REFERENCES memory_items (id) ON DELETE CASCADE,
    span_id    TEXT NOT NULL,
    label      TEXT,
    note       TEXT,
    created_at TEXT NOT NULL,
    PRIMARY KEY (memory_id, span_id)
);

CREATE TABLE interactions (
    id                TEXT PRIMARY KEY,
    session_id        TEXT NOT NULL REFERENCES sessions (session_id) ON DELETE CASCADE,
    query             TEXT NOT NULL,
    intent            TEXT NOT NULL,
    bundle_signature  TEXT NOT NULL,
    top_click         TEXT,
    satisfied         INTEGER,
    time_to_fix_ms    INTEGER,
    token_usage       INTEGER NOT NULL,
    seed_weights      TEXT NOT NULL,
    policy_thresholds TEXT NOT NULL,
    language          TEXT,
    repo              TEXT,
    created_at        TEXT NOT NULL
);
CREATE INDEX interactions_intent_idx ON interactions (intent, created_at);

CREATE TABLE policy_row (
    repo       TEXT NOT NULL,
    intent     TEXT NOT NULL,
    version    INTEGER NOT NULL,
    decision   TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (repo, intent)
);

CREATE TABLE packing_profile (
    repo        TEXT NOT NULL,
    model       TEXT NOT NULL,
    version     INTEGER NOT NULL,
    profile     TEXT NOT NULL,
    ttl_seconds INTEGER,
    updated_at  TEXT NOT NULL,
    PRIMARY KEY (repo, model)
);

CREATE TABLE signature_cache (
    query_signature TEXT PRIMARY KEY,
    bundle_id       TEXT NOT NULL,
    bundle          TEXT NOT NULL,
    satisfaction    REAL NOT NULL,
    usage_count     INTEGER NOT NULL DEFAULT 0,
    created_at      TEXT NOT NULL,
    last_used_at    TEXT NOT NULL,
    expires_at      TEXT NOT NULL
);
"#;

/// Apply every pending migration. Safe to call at every startup.
pub fn apply_migrations(conn: &mut Connection) -> Result<(), StoreError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version    INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL
        )",
        [],
    )?;

    let current: i64 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )?;

    for (version, sql) in MIGRATIONS {
        if *version <= current {
            continue;
        }
        let tx = conn.transaction()?;
        tx.execute_batch(sql)?;
        tx.execute(
            "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
            rusqlite::params![version, super::to_ts(chrono::Utc::now())],
        )?;
        tx.commit()?;
        info!(version, "Applied schema migration");
    }

    Ok(())
}
