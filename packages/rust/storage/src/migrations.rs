//! SQL migration definitions for the SQLite backend.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a set of SQL statements executed as a batch.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![Migration {
        version: 1,
        description: "Initial schema: operations, fingerprints, tags, crawler_meta",
        sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Queued operations. seq preserves per-crawler FIFO order.
CREATE TABLE IF NOT EXISTS operations (
    seq         INTEGER PRIMARY KEY AUTOINCREMENT,
    id          TEXT NOT NULL,
    crawler     TEXT NOT NULL,
    stage       TEXT NOT NULL,
    payload     TEXT NOT NULL,
    enqueued_at TEXT NOT NULL,
    attempt     INTEGER NOT NULL DEFAULT 1
);

CREATE INDEX IF NOT EXISTS idx_operations_crawler ON operations(crawler, seq);

-- Incremental-mode dedup fingerprints
CREATE TABLE IF NOT EXISTS fingerprints (
    crawler     TEXT NOT NULL,
    fingerprint TEXT NOT NULL,
    created_at  TEXT NOT NULL,
    UNIQUE(crawler, fingerprint)
);

CREATE INDEX IF NOT EXISTS idx_fingerprints_crawler ON fingerprints(crawler);

-- Stage-produced tags
CREATE TABLE IF NOT EXISTS tags (
    crawler    TEXT NOT NULL,
    key        TEXT NOT NULL,
    value      TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE(crawler, key)
);

CREATE INDEX IF NOT EXISTS idx_tags_crawler ON tags(crawler);

-- Per-crawler run metadata
CREATE TABLE IF NOT EXISTS crawler_meta (
    crawler  TEXT PRIMARY KEY,
    last_run TEXT
);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
    }]
}
