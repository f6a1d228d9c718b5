//! SQLite-backed Run Store: which runs have already been announced.
//!
//! This is the single source of truth for deduplication across restarts.
//! The daemon opens it read-write; CLI commands such as `history` open it
//! read-only and rely on WAL mode so they never block (or get blocked by)
//! the daemon's writer for more than `busy_timeout`.

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

use crate::repos::TrackedRepository;
use crate::run::{Conclusion, RunStatus};

/// Bump together with a new step in `migrate`.
const CURRENT_SCHEMA_VERSION: i64 = 1;
const BUSY_TIMEOUT_MS: u32 = 5000;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to open run store {}: {source}", .path.display())]
    Open {
        path: PathBuf,
        source: rusqlite::Error,
    },

    #[error("failed to create state directory {}: {source}", .path.display())]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("run store schema version {found} is newer than supported version {supported}")]
    SchemaTooNew { found: i64, supported: i64 },

    #[error("run store journal mode is {0:?}, expected WAL")]
    JournalMode(String),

    #[error("run store query failed: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("run store lock poisoned")]
    Poisoned,
}

/// A run that has been announced (or deliberately not announced because of
/// the notify flags) and must never be announced again.
#[derive(Debug, Clone, PartialEq)]
pub struct SeenRecord {
    pub repo: String,
    pub run_id: String,
    pub workflow: String,
    pub conclusion: Conclusion,
    /// Upstream update time of the run.
    pub run_timestamp: DateTime<Utc>,
    /// When the daemon committed the record.
    pub recorded_at: DateTime<Utc>,
}

pub struct RunStore {
    conn: Mutex<Connection>,
}

impl RunStore {
    /// Opens (or creates) the store for writing and applies pending migrations.
    ///
    /// Configured with `journal_mode = WAL` so readers can proceed alongside
    /// the writer, and `synchronous = FULL` so a committed record survives a
    /// crash or power loss.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let conn = Connection::open(path).map_err(|source| StoreError::Open {
            path: path.to_path_buf(),
            source,
        })?;

        let journal_mode: String =
            conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        if !journal_mode.eq_ignore_ascii_case("wal") {
            return Err(StoreError::JournalMode(journal_mode));
        }
        conn.execute_batch("PRAGMA synchronous = FULL;")?;
        conn.busy_timeout(std::time::Duration::from_millis(BUSY_TIMEOUT_MS.into()))?;

        migrate(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Opens an existing store without write access, for CLI readers.
    pub fn open_read_only(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|source| StoreError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        conn.busy_timeout(std::time::Duration::from_millis(BUSY_TIMEOUT_MS.into()))?;

        let version = schema_version(&conn)?;
        if version > CURRENT_SCHEMA_VERSION {
            return Err(StoreError::SchemaTooNew {
                found: version,
                supported: CURRENT_SCHEMA_VERSION,
            });
        }

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// `true` if no record exists for this repository + run pair.
    pub fn is_new(&self, repo: &TrackedRepository, run_id: &str) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM seen_runs WHERE repo = ?1 AND run_id = ?2",
                params![repo.as_str(), run_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_none())
    }

    /// Durably records `run` as seen. Recording the same pair twice is a no-op.
    pub fn mark_seen(&self, run: &RunStatus) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR IGNORE INTO seen_runs
             (repo, run_id, workflow, conclusion, run_timestamp, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                run.repo.as_str(),
                run.run_id,
                run.workflow,
                run.conclusion.as_str(),
                run.timestamp.to_rfc3339(),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// The `limit` most recently recorded runs, newest first.
    pub fn recent(&self, limit: usize) -> Result<Vec<SeenRecord>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT repo, run_id, workflow, conclusion, run_timestamp, recorded_at
             FROM seen_runs ORDER BY seq DESC LIMIT ?1",
        )?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt.query_map(params![limit], row_to_record)?;

        let mut records = Vec::new();
        for r in rows {
            records.push(r?);
        }
        Ok(records)
    }

    pub fn count(&self) -> Result<u64, StoreError> {
        let conn = self.lock()?;
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM seen_runs", [], |row| row.get(0))?;
        Ok(n.max(0) as u64)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }
}

fn schema_version(conn: &Connection) -> Result<i64, StoreError> {
    let version: Option<i64> = conn
        .query_row(
            "SELECT version FROM schema_version WHERE id = 1",
            [],
            |row| row.get(0),
        )
        .optional()?;
    Ok(version.unwrap_or(0))
}

fn migrate(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
             id INTEGER PRIMARY KEY CHECK (id = 1),
             version INTEGER NOT NULL
         );",
    )?;

    let from = schema_version(conn)?;
    if from > CURRENT_SCHEMA_VERSION {
        return Err(StoreError::SchemaTooNew {
            found: from,
            supported: CURRENT_SCHEMA_VERSION,
        });
    }
    if from == CURRENT_SCHEMA_VERSION {
        return Ok(());
    }

    // `seq` gives reverse-chronological reads without a sort over the table;
    // the UNIQUE constraint doubles as the (repo, run_id) lookup index.
    if from < 1 {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS seen_runs (
                 seq INTEGER PRIMARY KEY AUTOINCREMENT,
                 repo TEXT NOT NULL,
                 run_id TEXT NOT NULL,
                 workflow TEXT NOT NULL,
                 conclusion TEXT NOT NULL,
                 run_timestamp TEXT NOT NULL,
                 recorded_at TEXT NOT NULL,
                 UNIQUE (repo, run_id)
             );",
        )?;
    }

    conn.execute(
        "INSERT INTO schema_version (id, version) VALUES (1, ?1)
         ON CONFLICT(id) DO UPDATE SET version = excluded.version",
        params![CURRENT_SCHEMA_VERSION],
    )?;
    tracing::debug!("Run store migrated from schema v{from} to v{CURRENT_SCHEMA_VERSION}");
    Ok(())
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<SeenRecord> {
    let conclusion: String = row.get(3)?;
    let conclusion = conclusion
        .parse::<Conclusion>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(e)))?;
    Ok(SeenRecord {
        repo: row.get(0)?,
        run_id: row.get(1)?,
        workflow: row.get(2)?,
        conclusion,
        run_timestamp: parse_timestamp(row, 4)?,
        recorded_at: parse_timestamp(row, 5)?,
    })
}

fn parse_timestamp(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}
