//! Change-marker cache for incremental ingestion.
//!
//! The [`ChangeMarkerCache`] trait is the contract the orchestrator relies on:
//! an entry for `org/name` exists only if an artifact was uploaded for exactly
//! that change marker. Two adapters are provided:
//! - [`LibsqlCache`]: a local libSQL database, which also keeps run history
//!   and index reconciliation records
//! - [`HttpCache`]: a client for a KV proxy service
//!
//! Entries never expire; they are overwritten or explicitly deleted.

mod http;
mod migrations;

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database, params};
use reposcrape_shared::{CacheKey, ReposcrapeError, Result, RunId};

pub use http::{HttpCache, KvEntry, KvStats};

/// Key/value contract between the orchestrator and its staleness cache.
#[async_trait]
pub trait ChangeMarkerCache: Send + Sync {
    /// Stored change marker for `key`, or `None` if never processed.
    async fn get(&self, key: &CacheKey) -> Result<Option<String>>;

    /// Write or overwrite the change marker for `key`.
    async fn set(&self, key: &CacheKey, change_marker: &str) -> Result<()>;

    /// Remove one entry. Returns whether it existed.
    async fn delete(&self, key: &CacheKey) -> Result<bool>;

    /// Remove every entry whose key starts with `prefix`. Returns the count.
    async fn delete_all(&self, prefix: &str) -> Result<u64>;

    /// Cheap reachability check used before a run starts.
    async fn ping(&self) -> Result<()>;
}

/// A recorded ingestion run.
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub stats_json: Option<String>,
}

/// A submitted index reconciliation.
#[derive(Debug, Clone)]
pub struct ReconciliationRecord {
    pub operation: String,
    pub mode: String,
    pub submitted_at: DateTime<Utc>,
}

/// libSQL-backed cache handle.
pub struct LibsqlCache {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    namespace: String,
    readonly: bool,
}

impl LibsqlCache {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path, namespace: &str) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ReposcrapeError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| ReposcrapeError::Cache(e.to_string()))?;

        let conn = db
            .connect()
            .map_err(|e| ReposcrapeError::Cache(e.to_string()))?;

        let cache = Self {
            db,
            conn,
            namespace: namespace.to_string(),
            readonly: false,
        };
        cache.run_migrations().await?;
        Ok(cache)
    }

    /// Open an existing database in read-only mode (inspection commands).
    pub async fn open_readonly(path: &Path, namespace: &str) -> Result<Self> {
        if !path.exists() {
            return Err(ReposcrapeError::Cache(format!(
                "cache database not found at {}",
                path.display()
            )));
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| ReposcrapeError::Cache(e.to_string()))?;

        let conn = db
            .connect()
            .map_err(|e| ReposcrapeError::Cache(e.to_string()))?;

        Ok(Self {
            db,
            conn,
            namespace: namespace.to_string(),
            readonly: true,
        })
    }

    /// Namespace this handle reads and writes.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        ReposcrapeError::Cache(format!(
                            "migration v{} failed: {e}",
                            migration.version
                        ))
                    })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(ReposcrapeError::Cache(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    /// Number of entries in this namespace.
    pub async fn count(&self) -> Result<u64> {
        let mut rows = self
            .conn
            .query(
                "SELECT COUNT(*) FROM change_markers WHERE namespace = ?1",
                params![self.namespace.as_str()],
            )
            .await
            .map_err(|e| ReposcrapeError::Cache(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(row.get::<i64>(0).unwrap_or(0) as u64),
            Ok(None) => Ok(0),
            Err(e) => Err(ReposcrapeError::Cache(e.to_string())),
        }
    }

    // -----------------------------------------------------------------------
    // Run history
    // -----------------------------------------------------------------------

    /// Record the start of a run.
    pub async fn insert_run(&self, id: &RunId) -> Result<()> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO ingest_runs (id, namespace, started_at) VALUES (?1, ?2, ?3)",
                params![id.to_string(), self.namespace.as_str(), now.as_str()],
            )
            .await
            .map_err(|e| ReposcrapeError::Cache(e.to_string()))?;
        Ok(())
    }

    /// Mark a run finished with its statistics.
    pub async fn finish_run(&self, id: &RunId, stats_json: &str) -> Result<()> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "UPDATE ingest_runs SET finished_at = ?1, stats_json = ?2 WHERE id = ?3",
                params![now.as_str(), stats_json, id.to_string()],
            )
            .await
            .map_err(|e| ReposcrapeError::Cache(e.to_string()))?;
        Ok(())
    }

    /// Most recent runs first.
    pub async fn list_runs(&self, limit: u32) -> Result<Vec<RunRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, started_at, finished_at, stats_json FROM ingest_runs
                 WHERE namespace = ?1 ORDER BY started_at DESC, id DESC LIMIT ?2",
                params![self.namespace.as_str(), limit],
            )
            .await
            .map_err(|e| ReposcrapeError::Cache(e.to_string()))?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let started: String = row
                .get(1)
                .map_err(|e| ReposcrapeError::Cache(e.to_string()))?;
            let finished: Option<String> = row.get::<String>(2).ok();
            results.push(RunRecord {
                id: row
                    .get::<String>(0)
                    .map_err(|e| ReposcrapeError::Cache(e.to_string()))?,
                started_at: parse_timestamp(&started)?,
                finished_at: finished.as_deref().map(parse_timestamp).transpose()?,
                stats_json: row.get::<String>(3).ok(),
            });
        }
        Ok(results)
    }

    // -----------------------------------------------------------------------
    // Reconciliations
    // -----------------------------------------------------------------------

    /// Record a submitted index reconciliation.
    pub async fn record_reconciliation(&self, operation: &str, mode: &str) -> Result<()> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO reconciliations (operation, namespace, mode, submitted_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(operation) DO UPDATE SET submitted_at = excluded.submitted_at",
                params![operation, self.namespace.as_str(), mode, now.as_str()],
            )
            .await
            .map_err(|e| ReposcrapeError::Cache(e.to_string()))?;
        Ok(())
    }

    /// The most recently submitted reconciliation, if any.
    pub async fn last_reconciliation(&self) -> Result<Option<ReconciliationRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT operation, mode, submitted_at FROM reconciliations
                 WHERE namespace = ?1 ORDER BY submitted_at DESC LIMIT 1",
                params![self.namespace.as_str()],
            )
            .await
            .map_err(|e| ReposcrapeError::Cache(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let submitted: String = row
                    .get(2)
                    .map_err(|e| ReposcrapeError::Cache(e.to_string()))?;
                Ok(Some(ReconciliationRecord {
                    operation: row
                        .get::<String>(0)
                        .map_err(|e| ReposcrapeError::Cache(e.to_string()))?,
                    mode: row
                        .get::<String>(1)
                        .map_err(|e| ReposcrapeError::Cache(e.to_string()))?,
                    submitted_at: parse_timestamp(&submitted)?,
                }))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(ReposcrapeError::Cache(e.to_string())),
        }
    }
}

#[async_trait]
impl ChangeMarkerCache for LibsqlCache {
    async fn get(&self, key: &CacheKey) -> Result<Option<String>> {
        let mut rows = self
            .conn
            .query(
                "SELECT change_marker FROM change_markers WHERE namespace = ?1 AND key = ?2",
                params![self.namespace.as_str(), key.to_string()],
            )
            .await
            .map_err(|e| ReposcrapeError::Cache(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let marker: String = row
                    .get(0)
                    .map_err(|e| ReposcrapeError::Cache(e.to_string()))?;
                Ok(Some(marker))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(ReposcrapeError::Cache(e.to_string())),
        }
    }

    async fn set(&self, key: &CacheKey, change_marker: &str) -> Result<()> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO change_markers (namespace, key, change_marker, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(namespace, key) DO UPDATE SET
                   change_marker = excluded.change_marker,
                   updated_at = excluded.updated_at",
                params![
                    self.namespace.as_str(),
                    key.to_string(),
                    change_marker,
                    now.as_str()
                ],
            )
            .await
            .map_err(|e| ReposcrapeError::Cache(e.to_string()))?;
        Ok(())
    }

    async fn delete(&self, key: &CacheKey) -> Result<bool> {
        self.check_writable()?;
        let affected = self
            .conn
            .execute(
                "DELETE FROM change_markers WHERE namespace = ?1 AND key = ?2",
                params![self.namespace.as_str(), key.to_string()],
            )
            .await
            .map_err(|e| ReposcrapeError::Cache(e.to_string()))?;
        Ok(affected > 0)
    }

    async fn delete_all(&self, prefix: &str) -> Result<u64> {
        self.check_writable()?;
        let pattern = format!("{}%", escape_like(prefix));
        let affected = self
            .conn
            .execute(
                "DELETE FROM change_markers WHERE namespace = ?1 AND key LIKE ?2 ESCAPE '\\'",
                params![self.namespace.as_str(), pattern],
            )
            .await
            .map_err(|e| ReposcrapeError::Cache(e.to_string()))?;
        tracing::info!(namespace = %self.namespace, prefix, deleted = affected, "cache entries deleted");
        Ok(affected)
    }

    async fn ping(&self) -> Result<()> {
        let mut rows = self
            .conn
            .query("SELECT 1", params![])
            .await
            .map_err(|e| ReposcrapeError::Cache(e.to_string()))?;
        rows.next()
            .await
            .map_err(|e| ReposcrapeError::Cache(e.to_string()))?;
        Ok(())
    }
}

/// Escape LIKE wildcards so a prefix matches literally.
fn escape_like(prefix: &str) -> String {
    let mut out = String::with_capacity(prefix.len());
    for c in prefix.chars() {
        if matches!(c, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| ReposcrapeError::Cache(format!("invalid date: {e}")))
}
