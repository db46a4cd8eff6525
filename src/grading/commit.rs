use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;

use crate::error::{GraderError, Result};
use crate::grading::PolicyLookup;
use crate::store::{format_timestamp, parse_timestamp, StoreError};

/// One grade-affecting mutation applied to a batch of users.
///
/// `score` and `slip_units` are independent: `None` leaves the stored value as is.
#[derive(Debug, Clone)]
pub struct GradeUpdate<'a> {
    pub users: &'a [String],
    pub assignment: &'a str,
    pub score: Option<f64>,
    pub slip_units: Option<i64>,
    pub transaction_name: &'a str,
    pub description: &'a str,
    pub source: &'a str,
    pub manual: bool,
    /// Drop users whose stored score is already at least `score`.
    pub dont_lower: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Grade {
    pub user: String,
    pub assignment: String,
    pub score: f64,
    pub slip_units: i64,
    pub updated: Option<DateTime<Utc>>,
    pub manual: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GradeLogEntry {
    pub transaction_name: String,
    pub description: Option<String>,
    pub source: Option<String>,
    pub updated: DateTime<Utc>,
    pub user: String,
    pub assignment: String,
    pub score: Option<f64>,
    pub slip_units: Option<i64>,
}

/// Apply `update` inside the caller's transaction and append one ledger row per
/// affected user. Returns the users that were actually changed, in input order.
pub fn assign_grade_batch(
    conn: &Connection,
    policy: &dyn PolicyLookup,
    update: &GradeUpdate<'_>,
) -> Result<Vec<String>> {
    if policy.assignment(update.assignment).is_none() {
        return Err(GraderError::UnknownAssignment(update.assignment.to_string()));
    }
    if update.score.is_none() && update.slip_units.is_none() {
        return Ok(Vec::new());
    }
    if update.dont_lower && update.score.is_none() {
        return Err(GraderError::InvalidGrade(
            "dont_lower requires a score".to_string(),
        ));
    }

    let mut users: Vec<String> = Vec::with_capacity(update.users.len());
    for user in update.users {
        if !users.contains(user) {
            users.push(user.clone());
        }
    }

    if update.dont_lower {
        let mut kept = Vec::with_capacity(users.len());
        for user in users {
            // Compared inside SQLite so the new score is rounded exactly the way
            // the stored one was.
            let already_higher: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM grades WHERE user = ?1 AND assignment = ?2 AND score >= ?3",
                    params![user, update.assignment, update.score],
                    |row| row.get(0),
                )
                .optional()?;
            if already_higher.is_none() {
                kept.push(user);
            }
        }
        users = kept;
    }
    if users.is_empty() {
        return Ok(users);
    }

    let timestamp = ledger_timestamp(conn, update.assignment, &users)?;
    for user in &users {
        conn.execute(
            "INSERT INTO grades (user, assignment) VALUES (?1, ?2)
             ON CONFLICT(user, assignment) DO NOTHING",
            params![user, update.assignment],
        )?;
        conn.execute(
            "UPDATE grades SET updated = ?1, manual = ?2,
                               score = COALESCE(?3, score),
                               slipunits = COALESCE(?4, slipunits)
             WHERE user = ?5 AND assignment = ?6",
            params![
                timestamp,
                update.manual,
                update.score,
                update.slip_units,
                user,
                update.assignment
            ],
        )?;
        conn.execute(
            "INSERT INTO gradeslog (transaction_name, description, source, updated, user,
                                    assignment, score, slipunits)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                update.transaction_name,
                update.description,
                update.source,
                timestamp,
                user,
                update.assignment,
                update.score,
                update.slip_units
            ],
        )?;
    }
    Ok(users)
}

/// Current time, bumped forward if the ledger already holds a later entry for
/// any of `users`, so per-user ledger timestamps never go backwards.
fn ledger_timestamp(
    conn: &Connection,
    assignment: &str,
    users: &[String],
) -> std::result::Result<String, StoreError> {
    let mut latest = format_timestamp(Utc::now());
    for user in users {
        let last: Option<String> = conn.query_row(
            "SELECT MAX(updated) FROM gradeslog WHERE user = ?1 AND assignment = ?2",
            params![user, assignment],
            |row| row.get(0),
        )?;
        if let Some(last) = last {
            if last > latest {
                latest = last;
            }
        }
    }
    Ok(latest)
}

pub fn get_grade(
    conn: &Connection,
    user: &str,
    assignment: &str,
) -> std::result::Result<Option<Grade>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT user, assignment, score, slipunits, updated, manual FROM grades
         WHERE user = ?1 AND assignment = ?2",
    )?;
    let mut rows = stmt.query(params![user, assignment])?;
    let Some(row) = rows.next()? else {
        return Ok(None);
    };
    let updated: Option<String> = row.get(4)?;
    Ok(Some(Grade {
        user: row.get(0)?,
        assignment: row.get(1)?,
        score: row.get(2)?,
        slip_units: row.get(3)?,
        updated: updated.as_deref().map(parse_timestamp).transpose()?,
        manual: row.get(5)?,
    }))
}

/// Ledger rows for `user`, oldest first, optionally limited to one assignment.
pub fn grade_log(
    conn: &Connection,
    user: &str,
    assignment: Option<&str>,
) -> std::result::Result<Vec<GradeLogEntry>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT transaction_name, description, source, updated, user, assignment, score, slipunits
         FROM gradeslog WHERE user = ?1 AND (?2 IS NULL OR assignment = ?2)
         ORDER BY updated ASC, id ASC",
    )?;
    let mut rows = stmt.query(params![user, assignment])?;
    let mut entries = Vec::new();
    while let Some(row) = rows.next()? {
        entries.push(log_entry(row)?);
    }
    Ok(entries)
}

fn log_entry(row: &Row<'_>) -> std::result::Result<GradeLogEntry, StoreError> {
    let updated: String = row.get(3)?;
    Ok(GradeLogEntry {
        transaction_name: row.get(0)?,
        description: row.get(1)?,
        source: row.get(2)?,
        updated: parse_timestamp(&updated)?,
        user: row.get(4)?,
        assignment: row.get(5)?,
        score: row.get(6)?,
        slip_units: row.get(7)?,
    })
}
