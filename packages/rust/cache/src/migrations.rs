//! SQL migration definitions for the reposcrape cache database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "Initial schema: change_markers",
            sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Last change marker an artifact was successfully uploaded for
CREATE TABLE IF NOT EXISTS change_markers (
    namespace     TEXT NOT NULL,
    key           TEXT NOT NULL,
    change_marker TEXT NOT NULL,
    updated_at    TEXT NOT NULL,
    PRIMARY KEY (namespace, key)
);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
        },
        Migration {
            version: 2,
            description: "Run history and index reconciliations",
            sql: r#"
CREATE TABLE IF NOT EXISTS ingest_runs (
    id          TEXT PRIMARY KEY,
    namespace   TEXT NOT NULL,
    started_at  TEXT NOT NULL,
    finished_at TEXT,
    stats_json  TEXT
);

CREATE INDEX IF NOT EXISTS idx_ingest_runs_namespace ON ingest_runs(namespace, started_at);

CREATE TABLE IF NOT EXISTS reconciliations (
    operation    TEXT PRIMARY KEY,
    namespace    TEXT NOT NULL,
    mode         TEXT NOT NULL,
    submitted_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_reconciliations_namespace ON reconciliations(namespace, submitted_at);

INSERT INTO schema_migrations (version) VALUES (2);
"#,
        },
    ]
}
