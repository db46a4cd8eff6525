use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use super::{next_counter, now_str, parse_timestamp, StoreError};

const BUILD_COUNTER_KEY: &str = "dockergrader_last_build_number";

const BUILD_COLUMNS: &str =
    "build_name, source, `commit`, message, job, status, score, started, updated, log";

/// Persisted build lifecycle. Integer codes are part of the stored schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    Queued,
    InProgress,
    Success,
    Failed,
}

impl BuildStatus {
    pub fn code(self) -> i64 {
        match self {
            BuildStatus::Queued => -2,
            BuildStatus::InProgress => -1,
            BuildStatus::Success => 0,
            BuildStatus::Failed => 1,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            -2 => Some(BuildStatus::Queued),
            -1 => Some(BuildStatus::InProgress),
            0 => Some(BuildStatus::Success),
            1 => Some(BuildStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, BuildStatus::Success | BuildStatus::Failed)
    }

    /// Text shown to students.
    pub fn describe(self) -> &'static str {
        match self {
            BuildStatus::Queued => "Waiting in queue",
            BuildStatus::InProgress => "In progress",
            BuildStatus::Success => "Completed",
            BuildStatus::Failed => "Failed to complete",
        }
    }
}

impl std::fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BuildStatus::Queued => write!(f, "queued"),
            BuildStatus::InProgress => write!(f, "in_progress"),
            BuildStatus::Success => write!(f, "success"),
            BuildStatus::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Build {
    pub name: String,
    pub source: String,
    pub commit: Option<String>,
    pub message: Option<String>,
    pub job: String,
    pub status: BuildStatus,
    pub score: f64,
    pub started: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub log: Option<String>,
}

impl Build {
    fn from_row(row: &Row<'_>) -> Result<Self, StoreError> {
        let status_code: i64 = row.get(5)?;
        let started: String = row.get(7)?;
        let updated: String = row.get(8)?;
        Ok(Self {
            name: row.get(0)?,
            source: row.get(1)?,
            commit: row.get(2)?,
            message: row.get(3)?,
            job: row.get(4)?,
            status: BuildStatus::from_code(status_code)
                .ok_or_else(|| StoreError::Corrupt(format!("build status {}", status_code)))?,
            score: row.get(6)?,
            started: parse_timestamp(&started)?,
            updated: parse_timestamp(&updated)?,
            log: row.get(9)?,
        })
    }
}

/// Insert a new QUEUED build and return its unique name (`{job}-build-{n}`).
pub fn create_build(
    conn: &Connection,
    job: &str,
    source: &str,
    commit: Option<&str>,
    message: Option<&str>,
) -> Result<String, StoreError> {
    let number = next_counter(conn, BUILD_COUNTER_KEY)?;
    let name = format!("{}-build-{}", job, number);
    let now = now_str();
    conn.execute(
        "INSERT INTO builds (build_name, source, `commit`, message, job, status, score,
                             started, updated, log)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0.0, ?7, ?7, NULL)",
        params![name, source, commit, message, job, BuildStatus::Queued.code(), now],
    )?;
    Ok(name)
}

pub fn get_build(conn: &Connection, name: &str) -> Result<Option<Build>, StoreError> {
    let sql = format!("SELECT {} FROM builds WHERE build_name = ?1", BUILD_COLUMNS);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(params![name])?;
    match rows.next()? {
        Some(row) => Ok(Some(Build::from_row(row)?)),
        None => Ok(None),
    }
}

/// Most recently started builds first.
pub fn list_builds(
    conn: &Connection,
    source: Option<&str>,
    limit: u32,
) -> Result<Vec<Build>, StoreError> {
    let sql = format!(
        "SELECT {} FROM builds WHERE (?1 IS NULL OR source = ?1)
         ORDER BY started DESC, build_name DESC LIMIT ?2",
        BUILD_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(params![source, limit])?;
    let mut builds = Vec::new();
    while let Some(row) = rows.next()? {
        builds.push(Build::from_row(row)?);
    }
    Ok(builds)
}

/// Builds for `source` (optionally only of `job`) that are queued or running.
pub fn count_active(conn: &Connection, source: &str, job: Option<&str>) -> Result<u32, StoreError> {
    let count: i64 = conn.query_row(
        "SELECT count(*) FROM builds
         WHERE source = ?1 AND status IN (?2, ?3) AND (?4 IS NULL OR job = ?4)",
        params![
            source,
            BuildStatus::Queued.code(),
            BuildStatus::InProgress.code(),
            job
        ],
        |row| row.get(0),
    )?;
    Ok(count as u32)
}

/// QUEUED -> IN_PROGRESS. Returns the build as it was before the transition,
/// or `None` when it is missing or no longer queued.
pub fn start_build(conn: &Connection, name: &str) -> Result<Option<Build>, StoreError> {
    let Some(build) = get_build(conn, name)? else {
        return Ok(None);
    };
    if build.status != BuildStatus::Queued {
        return Ok(None);
    }
    let changed = conn.execute(
        "UPDATE builds SET status = ?1, updated = ?2 WHERE build_name = ?3 AND status = ?4",
        params![
            BuildStatus::InProgress.code(),
            now_str(),
            name,
            BuildStatus::Queued.code()
        ],
    )?;
    Ok((changed == 1).then_some(build))
}

/// IN_PROGRESS -> SUCCESS. Returns false if the build was stopped meanwhile.
pub fn complete_build(
    conn: &Connection,
    name: &str,
    score: f64,
    log: &str,
) -> Result<bool, StoreError> {
    let changed = conn.execute(
        "UPDATE builds SET status = ?1, score = ?2, updated = ?3, log = ?4
         WHERE build_name = ?5 AND status = ?6",
        params![
            BuildStatus::Success.code(),
            score,
            now_str(),
            log,
            name,
            BuildStatus::InProgress.code()
        ],
    )?;
    Ok(changed == 1)
}

/// Move a build to FAILED with `log`, but only from one of the `from` states.
pub fn fail_build(
    conn: &Connection,
    name: &str,
    log: &str,
    from: &[BuildStatus],
) -> Result<bool, StoreError> {
    let mut changed = 0;
    for status in from.iter().filter(|s| !s.is_terminal()) {
        changed += conn.execute(
            "UPDATE builds SET status = ?1, updated = ?2, log = ?3
             WHERE build_name = ?4 AND status = ?5",
            params![
                BuildStatus::Failed.code(),
                now_str(),
                log,
                name,
                status.code()
            ],
        )?;
    }
    Ok(changed > 0)
}

/// Startup sweep: nothing can still be running after a restart.
pub fn reset_unfinished(conn: &Connection) -> Result<usize, StoreError> {
    let changed = conn.execute(
        "UPDATE builds SET status = ?1, updated = ?2 WHERE status IN (?3, ?4)",
        params![
            BuildStatus::Failed.code(),
            now_str(),
            BuildStatus::Queued.code(),
            BuildStatus::InProgress.code()
        ],
    )?;
    Ok(changed)
}

/// Used to look up the current status without holding a `Build`.
pub fn build_status(conn: &Connection, name: &str) -> Result<Option<BuildStatus>, StoreError> {
    let code: Option<i64> = conn
        .query_row(
            "SELECT status FROM builds WHERE build_name = ?1",
            params![name],
            |row| row.get(0),
        )
        .optional()?;
    match code {
        None => Ok(None),
        Some(code) => BuildStatus::from_code(code)
            .map(Some)
            .ok_or_else(|| StoreError::Corrupt(format!("build status {}", code))),
    }
}
