//! SQLite-backed repository sync audit.
//!
//! One row per repository carries the incremental sync cursor
//! (`successful_sync_time`) and the outcome of the last attempt. The
//! activity phase walks rows never-synced and longest-stale first.
//!
//! Synchronous rusqlite calls run under `tokio::task::spawn_blocking` so
//! they never stall the async runtime.

use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use thiserror::Error;

/// Current schema version. Increment on schema changes and add migration
/// steps in `run_migrations`.
const CURRENT_SCHEMA_VERSION: i64 = 1;

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit store failed to {operation}: {message}")]
    Storage { operation: String, message: String },

    #[error("audit store data corruption: {0}")]
    DataCorruption(String),
}

impl AuditError {
    fn storage(operation: &str, message: impl ToString) -> Self {
        AuditError::Storage {
            operation: operation.to_string(),
            message: message.to_string(),
        }
    }
}

/// One audit row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoSyncAudit {
    /// Repository slug; unique.
    pub id: String,
    pub repo_name: String,
    pub workspace_slug: String,
    /// The incremental cursor; `None` until the first successful sync window.
    pub successful_sync_time: Option<DateTime<Utc>>,
    pub success: bool,
    pub error_context: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields for a first-sighting insert; everything else starts empty.
#[derive(Debug, Clone)]
pub struct NewRepoSyncAudit {
    pub id: String,
    pub repo_name: String,
    pub workspace_slug: String,
}

/// Outcome written back after a sync attempt.
#[derive(Debug, Clone)]
pub struct SyncOutcome {
    pub successful_sync_time: DateTime<Utc>,
    pub success: bool,
    pub error_context: Option<String>,
}

/// RFC 3339 with fixed-width microseconds so lexicographic TEXT ordering is
/// chronological ordering.
fn to_db_time(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn from_db_time(raw: &str) -> Result<DateTime<Utc>, AuditError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| AuditError::DataCorruption(format!("bad timestamp {raw:?}: {e}")))
}

pub struct SqliteAuditStore {
    /// `pub(crate)` so tests can adjust row timestamps directly.
    pub(crate) conn: Arc<Mutex<Connection>>,
}

impl SqliteAuditStore {
    /// Opens (or creates) the audit database, configures durability and
    /// runs pending migrations. Blocking; see [`SqliteAuditStore::open`].
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, AuditError> {
        let path_ref = path.as_ref();
        if let Some(parent) = path_ref.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| AuditError::storage("create database directory", e))?;
            }
        }

        let conn = Connection::open(path_ref)
            .map_err(|e| AuditError::storage("open database", e))?;
        Self::from_connection(conn, false)
    }

    /// In-memory store for tests.
    pub fn new_in_memory() -> Result<Self, AuditError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| AuditError::storage("open in-memory database", e))?;
        Self::from_connection(conn, true)
    }

    /// Async-friendly constructor used by the worker's startup path.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, AuditError> {
        let path = path.as_ref().to_path_buf();
        tokio::task::spawn_blocking(move || Self::new(path))
            .await
            .map_err(|e| AuditError::storage("open database", e))?
    }

    fn from_connection(conn: Connection, in_memory: bool) -> Result<Self, AuditError> {
        // WAL can be silently refused on filesystems without shared-memory
        // support, which would break the durability assumptions, so verify
        // what SQLite actually selected.
        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
            .map_err(|e| AuditError::storage("set journal_mode", e))?;
        let journal_mode_ok = journal_mode.eq_ignore_ascii_case("wal")
            || (in_memory && journal_mode.eq_ignore_ascii_case("memory"));
        if !journal_mode_ok {
            return Err(AuditError::storage(
                "configure journal_mode",
                format!("expected WAL, SQLite selected {journal_mode:?}"),
            ));
        }

        conn.execute_batch(
            r#"
            PRAGMA synchronous = FULL;
            PRAGMA busy_timeout = 5000;
            "#,
        )
        .map_err(|e| AuditError::storage("configure pragmas", e))?;

        run_migrations(&conn)?;

        Ok(SqliteAuditStore {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Audit row for a repository, or `None` when the repo has never been
    /// seen.
    pub async fn get_by_id(&self, id: &str) -> Result<Option<RepoSyncAudit>, AuditError> {
        let conn = self.conn.clone();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            conn.query_row(
                "SELECT id, repo_name, workspace_slug, successful_sync_time, success,
                        error_context, created_at, updated_at
                 FROM repository_sync_audit WHERE id = ?1",
                params![id],
                row_to_audit,
            )
            .optional()
            .map_err(|e| AuditError::storage("get audit row", e))?
            .transpose()
        })
        .await
        .map_err(|e| AuditError::storage("get audit row", e))?
    }

    /// Inserts a first-sighting row: never synced, not successful.
    pub async fn create(&self, new: NewRepoSyncAudit) -> Result<(), AuditError> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let now = to_db_time(Utc::now());
            let conn = conn.lock().unwrap();
            conn.execute(
                "INSERT INTO repository_sync_audit
                    (id, repo_name, workspace_slug, successful_sync_time, success,
                     error_context, created_at, updated_at)
                 VALUES (?1, ?2, ?3, NULL, 0, NULL, ?4, ?4)",
                params![new.id, new.repo_name, new.workspace_slug, now],
            )
            .map_err(|e| AuditError::storage("create audit row", e))?;
            Ok(())
        })
        .await
        .map_err(|e| AuditError::storage("create audit row", e))?
    }

    /// Writes the outcome of a sync attempt back to the row.
    pub async fn update(&self, id: &str, outcome: SyncOutcome) -> Result<(), AuditError> {
        let conn = self.conn.clone();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || {
            let now = to_db_time(Utc::now());
            let conn = conn.lock().unwrap();
            let changed = conn
                .execute(
                    "UPDATE repository_sync_audit
                     SET successful_sync_time = ?2, success = ?3, error_context = ?4,
                         updated_at = ?5
                     WHERE id = ?1",
                    params![
                        id,
                        to_db_time(outcome.successful_sync_time),
                        outcome.success,
                        outcome.error_context,
                        now
                    ],
                )
                .map_err(|e| AuditError::storage("update audit row", e))?;
            if changed == 0 {
                return Err(AuditError::storage(
                    "update audit row",
                    format!("no audit row with id {id:?}"),
                ));
            }
            Ok(())
        })
        .await
        .map_err(|e| AuditError::storage("update audit row", e))?
    }

    /// One page of active audit rows, never-synced and longest-stale first.
    ///
    /// SQLite sorts NULL before any value on ascending order, which is
    /// exactly the "never synced first" requirement; `created_at` breaks
    /// ties so the walk order is stable.
    pub async fn list_active(
        &self,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<RepoSyncAudit>, AuditError> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            let mut statement = conn
                .prepare(
                    "SELECT id, repo_name, workspace_slug, successful_sync_time, success,
                            error_context, created_at, updated_at
                     FROM repository_sync_audit
                     ORDER BY successful_sync_time ASC, created_at ASC
                     LIMIT ?1 OFFSET ?2",
                )
                .map_err(|e| AuditError::storage("list audit rows", e))?;
            let rows = statement
                .query_map(params![limit, offset], row_to_audit)
                .map_err(|e| AuditError::storage("list audit rows", e))?;

            let mut audits = Vec::new();
            for row in rows {
                audits.push(row.map_err(|e| AuditError::storage("list audit rows", e))??);
            }
            Ok(audits)
        })
        .await
        .map_err(|e| AuditError::storage("list audit rows", e))?
    }
}

fn row_to_audit(row: &Row<'_>) -> rusqlite::Result<Result<RepoSyncAudit, AuditError>> {
    let id: String = row.get(0)?;
    let repo_name: String = row.get(1)?;
    let workspace_slug: String = row.get(2)?;
    let successful_sync_time: Option<String> = row.get(3)?;
    let success: bool = row.get(4)?;
    let error_context: Option<String> = row.get(5)?;
    let created_at: String = row.get(6)?;
    let updated_at: String = row.get(7)?;

    Ok((|| {
        Ok(RepoSyncAudit {
            id,
            repo_name,
            workspace_slug,
            successful_sync_time: successful_sync_time
                .as_deref()
                .map(from_db_time)
                .transpose()?,
            success,
            error_context,
            created_at: from_db_time(&created_at)?,
            updated_at: from_db_time(&updated_at)?,
        })
    })())
}

fn run_migrations(conn: &Connection) -> Result<(), AuditError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
    )
    .map_err(|e| AuditError::storage("create schema_version table", e))?;

    let version: Option<i64> = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
            row.get(0)
        })
        .optional()
        .map_err(|e| AuditError::storage("read schema version", e))?;

    match version {
        None => {
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS repository_sync_audit (
                     id TEXT PRIMARY KEY,
                     repo_name TEXT NOT NULL,
                     workspace_slug TEXT NOT NULL,
                     successful_sync_time TEXT,
                     success INTEGER NOT NULL DEFAULT 0,
                     error_context TEXT,
                     created_at TEXT NOT NULL,
                     updated_at TEXT NOT NULL
                 );",
            )
            .map_err(|e| AuditError::storage("create audit table", e))?;
            conn.execute(
                "INSERT INTO schema_version (version) VALUES (?1)",
                params![CURRENT_SCHEMA_VERSION],
            )
            .map_err(|e| AuditError::storage("record schema version", e))?;
        }
        Some(CURRENT_SCHEMA_VERSION) => {}
        Some(other) => {
            return Err(AuditError::storage(
                "check schema version",
                format!("unsupported schema version {other}"),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn new_row(id: &str) -> NewRepoSyncAudit {
        NewRepoSyncAudit {
            id: id.to_string(),
            repo_name: format!("repo {id}"),
            workspace_slug: "acme".to_string(),
        }
    }

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let store = SqliteAuditStore::new_in_memory().unwrap();
        store.create(new_row("api")).await.unwrap();

        let audit = store.get_by_id("api").await.unwrap().unwrap();
        assert_eq!(audit.repo_name, "repo api");
        assert_eq!(audit.workspace_slug, "acme");
        assert!(audit.successful_sync_time.is_none());
        assert!(!audit.success);
        assert!(audit.error_context.is_none());
    }

    #[tokio::test]
    async fn get_missing_row_is_none() {
        let store = SqliteAuditStore::new_in_memory().unwrap();
        assert!(store.get_by_id("ghost").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_create_is_an_error() {
        let store = SqliteAuditStore::new_in_memory().unwrap();
        store.create(new_row("api")).await.unwrap();
        assert!(store.create(new_row("api")).await.is_err());
    }

    #[tokio::test]
    async fn update_writes_outcome_fields() {
        let store = SqliteAuditStore::new_in_memory().unwrap();
        store.create(new_row("api")).await.unwrap();

        store
            .update(
                "api",
                SyncOutcome {
                    successful_sync_time: at(1000),
                    success: false,
                    error_context: Some("timeout".into()),
                },
            )
            .await
            .unwrap();

        let audit = store.get_by_id("api").await.unwrap().unwrap();
        assert_eq!(audit.successful_sync_time, Some(at(1000)));
        assert!(!audit.success);
        assert_eq!(audit.error_context.as_deref(), Some("timeout"));

        store
            .update(
                "api",
                SyncOutcome {
                    successful_sync_time: at(2000),
                    success: true,
                    error_context: None,
                },
            )
            .await
            .unwrap();

        let audit = store.get_by_id("api").await.unwrap().unwrap();
        assert_eq!(audit.successful_sync_time, Some(at(2000)));
        assert!(audit.success);
        assert!(audit.error_context.is_none());
    }

    #[tokio::test]
    async fn update_of_missing_row_is_an_error() {
        let store = SqliteAuditStore::new_in_memory().unwrap();
        let err = store
            .update(
                "ghost",
                SyncOutcome {
                    successful_sync_time: at(1),
                    success: true,
                    error_context: None,
                },
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[tokio::test]
    async fn listing_orders_never_synced_then_stalest() {
        let store = SqliteAuditStore::new_in_memory().unwrap();
        for id in ["fresh", "stale", "never-a", "never-b"] {
            store.create(new_row(id)).await.unwrap();
        }
        store
            .update(
                "fresh",
                SyncOutcome {
                    successful_sync_time: at(9000),
                    success: true,
                    error_context: None,
                },
            )
            .await
            .unwrap();
        store
            .update(
                "stale",
                SyncOutcome {
                    successful_sync_time: at(1000),
                    success: true,
                    error_context: None,
                },
            )
            .await
            .unwrap();
        // Pin creation order so the tie between the never-synced rows is
        // deterministic.
        {
            let conn = store.conn.lock().unwrap();
            conn.execute(
                "UPDATE repository_sync_audit SET created_at = ?2 WHERE id = ?1",
                params!["never-a", to_db_time(at(10))],
            )
            .unwrap();
            conn.execute(
                "UPDATE repository_sync_audit SET created_at = ?2 WHERE id = ?1",
                params!["never-b", to_db_time(at(20))],
            )
            .unwrap();
        }

        let audits = store.list_active(100, 0).await.unwrap();
        let ids: Vec<&str> = audits.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, vec!["never-a", "never-b", "stale", "fresh"]);
    }

    #[tokio::test]
    async fn listing_paginates_with_limit_and_offset() {
        let store = SqliteAuditStore::new_in_memory().unwrap();
        for i in 0..5 {
            store.create(new_row(&format!("repo-{i}"))).await.unwrap();
        }

        let first = store.list_active(2, 0).await.unwrap();
        let second = store.list_active(2, 2).await.unwrap();
        let rest = store.list_active(2, 4).await.unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(second.len(), 2);
        assert_eq!(rest.len(), 1);
    }

    #[tokio::test]
    async fn reopening_preserves_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("database.db");

        {
            let store = SqliteAuditStore::open(&path).await.unwrap();
            store.create(new_row("api")).await.unwrap();
        }

        let store = SqliteAuditStore::open(&path).await.unwrap();
        assert!(store.get_by_id("api").await.unwrap().is_some());
    }
}
