use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Dispatch queue entry. Lives only in memory; the worker reloads the
/// persisted build by name when it picks the job up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub build_name: String,
    pub source: String,
    /// Human-readable reason the build was started (e.g. "GitHub push")
    pub trigger: String,
    /// Whether a successful build may change grades
    pub graded: bool,
    pub created_at: DateTime<Utc>,
}

impl Job {
    pub fn new(
        build_name: impl Into<String>,
        source: impl Into<String>,
        trigger: impl Into<String>,
        graded: bool,
    ) -> Self {
        Self {
            build_name: build_name.into(),
            source: source.into(),
            trigger: trigger.into(),
            graded,
            created_at: Utc::now(),
        }
    }
}
