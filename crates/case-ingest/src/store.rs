//! SQLite persistence shared by the governor, ledger, evidence index, and commit path.
//!
//! One database file holds every durable table. Writers that need atomicity go
//! through [`Database::with_tx`], which opens a `BEGIN IMMEDIATE` transaction so
//! the write lock is taken up front instead of on the first write.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, Transaction, TransactionBehavior};

use crate::types::{IngestError, IngestResult};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS admission_state (
    source_id TEXT PRIMARY KEY,
    day TEXT NOT NULL,
    requests_today INTEGER NOT NULL,
    effective_rpm INTEGER NOT NULL,
    last_captcha_at TEXT,
    outcomes TEXT NOT NULL DEFAULT '[]',
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS ingestion_runs (
    run_id TEXT PRIMARY KEY,
    source_id TEXT NOT NULL,
    unit_key TEXT NOT NULL,
    status TEXT NOT NULL,
    started_at TEXT NOT NULL,
    finished_at TEXT,
    processed INTEGER NOT NULL DEFAULT 0,
    failed INTEGER NOT NULL DEFAULT 0,
    notes TEXT
);
CREATE INDEX IF NOT EXISTS idx_runs_status_started ON ingestion_runs (status, started_at);
CREATE INDEX IF NOT EXISTS idx_runs_unit ON ingestion_runs (source_id, unit_key);

CREATE TABLE IF NOT EXISTS evidence (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source_id TEXT NOT NULL,
    unit_key TEXT NOT NULL,
    kind TEXT NOT NULL,
    family TEXT,
    filename TEXT NOT NULL,
    path TEXT NOT NULL,
    content_hash TEXT NOT NULL,
    size_bytes INTEGER NOT NULL,
    run_id TEXT,
    captured_at TEXT NOT NULL,
    UNIQUE (unit_key, kind, content_hash)
);

CREATE TABLE IF NOT EXISTS case_registry (
    source_id TEXT NOT NULL,
    unit_key TEXT NOT NULL,
    last_run_id TEXT NOT NULL,
    last_status TEXT NOT NULL,
    blocked INTEGER NOT NULL DEFAULT 0,
    signal_location TEXT,
    evidence_count INTEGER NOT NULL DEFAULT 0,
    first_seen_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (source_id, unit_key)
);

CREATE TABLE IF NOT EXISTS derived_records (
    natural_key TEXT PRIMARY KEY,
    source_id TEXT NOT NULL,
    unit_key TEXT NOT NULL,
    fields TEXT NOT NULL,
    grade TEXT,
    workflow_class TEXT,
    quality REAL NOT NULL DEFAULT 0,
    origin_run_id TEXT NOT NULL,
    evidence_ids TEXT NOT NULL DEFAULT '[]',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS audit_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id TEXT NOT NULL,
    source_id TEXT NOT NULL,
    unit_key TEXT NOT NULL,
    action TEXT NOT NULL,
    detail TEXT,
    created_at TEXT NOT NULL,
    UNIQUE (run_id, action)
);
";

/// Handle to the ingestion database.
pub struct Database {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl Database {
    /// Open or create the database file, creating parent directories as needed.
    pub fn open(path: &Path) -> IngestResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        Self::init(conn, Some(path.to_path_buf()))
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> IngestResult<Self> {
        Self::init(Connection::open_in_memory()?, None)
    }

    fn init(conn: Connection, path: Option<PathBuf>) -> IngestResult<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        tracing::debug!(
            "Database ready at {}",
            path.as_deref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| ":memory:".to_string())
        );
        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    /// Path of the backing file, `None` when in memory.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        // A panic while holding the guard drops any open transaction, which rolls it back.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run a read or single-statement write.
    pub fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> IngestResult<T> {
        let conn = self.lock();
        f(&conn).map_err(IngestError::from)
    }

    /// Run `f` inside an immediate transaction. Any error rolls every write back.
    pub fn with_tx<T>(
        &self,
        f: impl FnOnce(&Transaction<'_>) -> IngestResult<T>,
    ) -> IngestResult<T> {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }
}

/// Fixed-width RFC 3339 encoding so stored timestamps sort lexicographically.
pub(crate) fn encode_ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Decode a timestamp column, reporting bad text as a column conversion error.
pub(crate) fn decode_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

pub(crate) fn decode_opt_ts(idx: usize, raw: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.map(|s| decode_ts(idx, &s)).transpose()
}
