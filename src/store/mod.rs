//! SQLite persistence for builds, grades and durable queues.
//!
//! All access goes through one process-wide lock around a single connection:
//! a unit of work holds the lock from `BEGIN IMMEDIATE` through `COMMIT`, so every
//! transaction is serialized against every other. Keep closures passed to
//! [`Store::transaction`] short and free of blocking I/O; sandbox execution must
//! never happen inside one.

pub mod builds;

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Transaction, TransactionBehavior};
use thiserror::Error;

use crate::error::{GraderError, Result};

pub use builds::{Build, BuildStatus};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const RETRY_INITIAL_DELAY: Duration = Duration::from_millis(10);
const RETRY_MAX_DELAY: Duration = Duration::from_secs(1);

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database is busy: {0}")]
    Busy(rusqlite::Error),

    #[error("sqlite: {0}")]
    Sql(rusqlite::Error),

    #[error("invalid stored value: {0}")]
    Corrupt(String),

    #[error("store lock poisoned")]
    Poisoned,
}

impl StoreError {
    /// Contention errors that go away if the unit of work is simply run again.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Busy(_))
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match err.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => {
                StoreError::Busy(err)
            }
            _ => StoreError::Sql(err),
        }
    }
}

impl From<rusqlite::Error> for GraderError {
    fn from(err: rusqlite::Error) -> Self {
        GraderError::Store(err.into())
    }
}

/// Handle to the grader database. Cheap to clone; clones share the lock.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish_non_exhaustive()
    }
}

impl Store {
    pub fn open(path: impl AsRef<Path>) -> std::result::Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> std::result::Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> std::result::Result<Self, StoreError> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        migrate(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` inside an immediate transaction while holding the store lock.
    /// The transaction commits when `f` returns `Ok` and rolls back otherwise.
    pub fn transaction<T, E, F>(&self, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&Transaction<'_>) -> std::result::Result<T, E>,
        E: From<StoreError>,
    {
        let mut conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(StoreError::from)?;
        let value = f(&tx)?;
        tx.commit().map_err(StoreError::from)?;
        Ok(value)
    }

    /// Read-only access under the same lock, without opening a write transaction.
    pub fn read<T, E, F>(&self, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&Connection) -> std::result::Result<T, E>,
        E: From<StoreError>,
    {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        f(&conn)
    }
}

fn migrate(conn: &Connection) -> std::result::Result<(), StoreError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS options (
          key TEXT PRIMARY KEY,
          value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS builds (
          build_name TEXT PRIMARY KEY,
          source TEXT NOT NULL,
          `commit` TEXT,
          message TEXT,
          job TEXT NOT NULL,
          status INTEGER NOT NULL,
          score REAL NOT NULL DEFAULT 0,
          started TEXT NOT NULL,
          updated TEXT NOT NULL,
          log TEXT
        );
        CREATE INDEX IF NOT EXISTS builds_source_status ON builds (source, status);

        CREATE TABLE IF NOT EXISTS grades (
          user TEXT NOT NULL,
          assignment TEXT NOT NULL,
          score REAL NOT NULL DEFAULT 0,
          slipunits INTEGER NOT NULL DEFAULT 0,
          updated TEXT,
          manual INTEGER NOT NULL DEFAULT 0,
          PRIMARY KEY (user, assignment)
        );

        CREATE TABLE IF NOT EXISTS gradeslog (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          transaction_name TEXT NOT NULL,
          description TEXT,
          source TEXT,
          updated TEXT NOT NULL,
          user TEXT NOT NULL,
          assignment TEXT NOT NULL,
          score REAL,
          slipunits INTEGER
        );
        CREATE INDEX IF NOT EXISTS gradeslog_user ON gradeslog (user, assignment);
        "#,
    )?;
    Ok(())
}

/// Increment and return the persisted counter `key`, starting at 1.
pub fn next_counter(conn: &Connection, key: &str) -> std::result::Result<i64, StoreError> {
    let current: Option<String> = conn
        .query_row("SELECT value FROM options WHERE key = ?1", params![key], |row| {
            row.get(0)
        })
        .optional()?;
    let next = match current {
        None => 1,
        Some(value) => {
            value
                .parse::<i64>()
                .map_err(|_| StoreError::Corrupt(format!("counter {} = {:?}", key, value)))?
                + 1
        }
    };
    conn.execute(
        "INSERT INTO options (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, next.to_string()],
    )?;
    Ok(next)
}

/// Fixed-width UTC timestamp, so text ordering matches time ordering.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn now_str() -> String {
    format_timestamp(Utc::now())
}

pub fn parse_timestamp(raw: &str) -> std::result::Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("timestamp {:?}: {}", raw, e)))
}

/// Run `op` until it stops failing with a transient store error.
///
/// Backoff starts at 10ms and doubles up to 1s between attempts. There is no
/// attempt cap; every non-transient error is returned immediately.
pub async fn retry_transient<T, F>(what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let mut delay = RETRY_INITIAL_DELAY;
    loop {
        match op() {
            Err(GraderError::Store(e)) if e.is_transient() => {
                tracing::warn!(operation = what, error = %e, delay_ms = delay.as_millis() as u64, "Store busy, retrying");
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(RETRY_MAX_DELAY);
            }
            other => return other,
        }
    }
}
