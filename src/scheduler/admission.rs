use rusqlite::Connection;

use crate::config::AdmissionConfig;
use crate::store::builds::count_active;
use crate::store::StoreError;

#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    Admitted,
    /// Carries the message persisted as the build log.
    Rejected(String),
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted)
    }
}

/// Caps how many builds one source may have queued or in progress.
#[derive(Debug, Clone, Default)]
pub struct AdmissionController {
    config: AdmissionConfig,
}

impl AdmissionController {
    pub fn new(config: AdmissionConfig) -> Self {
        Self { config }
    }

    pub fn max_ongoing_builds(&self) -> Option<u32> {
        self.config.max_ongoing_builds
    }

    /// Decide on a build that has already been inserted as QUEUED in the
    /// caller's transaction, so the count includes it. The build is rejected
    /// only when the count is strictly above the ceiling.
    pub fn check(&self, conn: &Connection, source: &str, job: &str) -> Result<Admission, StoreError> {
        let Some(max) = self.config.max_ongoing_builds else {
            return Ok(Admission::Admitted);
        };
        let scope = self.config.per_assignment.then_some(job);
        let active = count_active(conn, source, scope)?;
        if active > max {
            tracing::info!(source, job, active, max, "Build rejected by admission control");
            return Ok(Admission::Rejected(rejection_message(max)));
        }
        Ok(Admission::Admitted)
    }
}

pub fn rejection_message(max: u32) -> String {
    let noun = if max == 1 { "build" } else { "builds" };
    format!(
        "Cannot have more than {} {} in progress or queued.",
        max, noun
    )
}
