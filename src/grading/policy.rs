use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::SlipConfig;
use crate::error::{GraderError, Result};

fn default_graded() -> bool {
    true
}

/// Scoring range, schedule and grading recipe for one assignment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assignment {
    pub name: String,
    pub full_score: f64,
    pub min_score: f64,
    pub max_score: f64,
    pub due_date: DateTime<Utc>,
    /// Builds of ungraded assignments never touch the grade book.
    #[serde(default = "default_graded")]
    pub graded: bool,
    /// Per-source due date overrides.
    #[serde(default)]
    pub extensions: HashMap<String, Extension>,
    #[serde(default)]
    pub grader: Option<GraderSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Extension {
    pub due_date: DateTime<Utc>,
}

/// Container recipe for assignments graded by [`crate::worker::ScriptHandler`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraderSpec {
    /// Falls back to the sandbox default image.
    #[serde(default)]
    pub image: Option<String>,
    /// Invoked as `command... <source> <commit>` inside the container.
    pub command: Vec<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl Assignment {
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(GraderError::Config("assignment name cannot be blank".into()));
        }
        if self.min_score > self.max_score {
            return Err(GraderError::Config(format!(
                "assignment {}: min_score {} exceeds max_score {}",
                self.name, self.min_score, self.max_score
            )));
        }
        if let Some(grader) = &self.grader {
            if grader.command.is_empty() {
                return Err(GraderError::Config(format!(
                    "assignment {}: grader command is empty",
                    self.name
                )));
            }
        }
        Ok(())
    }

    /// The assignment as seen by `source`, with its extension applied.
    pub fn student_view(&self, source: &str) -> Assignment {
        let mut view = self.clone();
        if let Some(extension) = self.extensions.get(source) {
            view.due_date = extension.due_date;
        }
        view
    }

    pub fn accepts_score(&self, score: f64) -> bool {
        score.is_finite() && self.min_score <= score && score <= self.max_score
    }
}

/// Resolves an assignment name to its policy.
pub trait PolicyLookup: Send + Sync {
    fn assignment(&self, name: &str) -> Option<Assignment>;
}

/// Resolves a source (personal or group repository) to the users that own it.
pub trait OwnerResolver: Send + Sync {
    fn owners(&self, source: &str) -> Vec<String>;
}

#[derive(Debug, Clone, Default)]
pub struct AssignmentBook {
    by_name: HashMap<String, Assignment>,
}

impl AssignmentBook {
    pub fn new(assignments: impl IntoIterator<Item = Assignment>) -> Self {
        Self {
            by_name: assignments
                .into_iter()
                .map(|a| (a.name.clone(), a))
                .collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Assignment> {
        self.by_name.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.by_name.keys().map(String::as_str)
    }
}

impl PolicyLookup for AssignmentBook {
    fn assignment(&self, name: &str) -> Option<Assignment> {
        self.by_name.get(name).cloned()
    }
}

/// Owners from configuration: listed sources are groups, anything else is a
/// personal repository named after its single owner.
#[derive(Debug, Clone, Default)]
pub struct ConfiguredOwners {
    groups: HashMap<String, Vec<String>>,
}

impl ConfiguredOwners {
    pub fn new(groups: HashMap<String, Vec<String>>) -> Self {
        Self { groups }
    }
}

impl OwnerResolver for ConfiguredOwners {
    fn owners(&self, source: &str) -> Vec<String> {
        match self.groups.get(source) {
            Some(members) => members.clone(),
            None => vec![source.to_string()],
        }
    }
}

/// Slip units consumed by submitting at `submitted` for a deadline of `due`.
pub fn slip_units(due: DateTime<Utc>, submitted: DateTime<Utc>, slip: &SlipConfig) -> i64 {
    // Milliseconds, so a fraction of a second late still counts
    let late_ms = (submitted - due).num_milliseconds() - slip.grace_period_secs * 1000;
    if late_ms <= 0 {
        return 0;
    }
    let unit_ms = slip.seconds_per_unit * 1000;
    // ceil for positive integers
    (late_ms + unit_ms - 1) / unit_ms
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn hw1(due: DateTime<Utc>) -> Assignment {
        Assignment {
            name: "hw1".into(),
            full_score: 10.0,
            min_score: 0.0,
            max_score: 10.0,
            due_date: due,
            graded: true,
            extensions: HashMap::new(),
            grader: None,
        }
    }

    #[test]
    fn on_time_uses_no_slip_units() {
        let due = Utc::now();
        let slip = SlipConfig::default();
        assert_eq!(slip_units(due, due, &slip), 0);
        assert_eq!(slip_units(due, due - Duration::hours(3), &slip), 0);
    }

    #[test]
    fn partial_unit_rounds_up() {
        let due = Utc::now();
        let slip = SlipConfig::default();
        assert_eq!(slip_units(due, due + Duration::seconds(1), &slip), 1);
        assert_eq!(slip_units(due, due + Duration::hours(2), &slip), 1);
        assert_eq!(slip_units(due, due + Duration::hours(25), &slip), 2);
    }

    #[test]
    fn sub_second_lateness_costs_a_unit() {
        let due = Utc::now();
        let slip = SlipConfig::default();
        assert_eq!(slip_units(due, due + Duration::milliseconds(500), &slip), 1);
        assert_eq!(slip_units(due, due + Duration::milliseconds(1), &slip), 1);
        assert_eq!(slip_units(due, due + Duration::days(1), &slip), 1);
        assert_eq!(
            slip_units(due, due + Duration::days(1) + Duration::milliseconds(1), &slip),
            2
        );

        let graced = SlipConfig {
            grace_period_secs: 1,
            ..SlipConfig::default()
        };
        assert_eq!(slip_units(due, due + Duration::milliseconds(999), &graced), 0);
        assert_eq!(slip_units(due, due + Duration::milliseconds(1001), &graced), 1);
    }

    #[test]
    fn grace_period_is_forgiven() {
        let due = Utc::now();
        let slip = SlipConfig {
            grace_period_secs: 600,
            seconds_per_unit: 3600,
            ..SlipConfig::default()
        };
        assert_eq!(slip_units(due, due + Duration::minutes(10), &slip), 0);
        assert_eq!(slip_units(due, due + Duration::minutes(11), &slip), 1);
        assert_eq!(slip_units(due, due + Duration::minutes(71), &slip), 2);
    }

    #[test]
    fn student_view_applies_extension() {
        let due = Utc::now();
        let mut assignment = hw1(due);
        let extended = due + Duration::days(2);
        assignment
            .extensions
            .insert("ab".into(), Extension { due_date: extended });

        assert_eq!(assignment.student_view("ab").due_date, extended);
        assert_eq!(assignment.student_view("cd").due_date, due);
    }

    #[test]
    fn score_range_is_inclusive() {
        let assignment = hw1(Utc::now());
        assert!(assignment.accepts_score(0.0));
        assert!(assignment.accepts_score(10.0));
        assert!(!assignment.accepts_score(10.5));
        assert!(!assignment.accepts_score(f64::NAN));
    }

    #[test]
    fn unlisted_source_is_personal() {
        let mut groups = HashMap::new();
        groups.insert("group7".to_string(), vec!["ab".to_string(), "cd".to_string()]);
        let owners = ConfiguredOwners::new(groups);
        assert_eq!(owners.owners("group7"), vec!["ab", "cd"]);
        assert_eq!(owners.owners("ef"), vec!["ef"]);
    }
}
