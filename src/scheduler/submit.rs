use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{GraderError, Result};
use crate::grading::PolicyLookup;
use crate::scheduler::admission::{Admission, AdmissionController};
use crate::scheduler::cancel::CancelRegistry;
use crate::scheduler::job::Job;
use crate::scheduler::queue::DispatchQueue;
use crate::store::builds::{self, Build, BuildStatus};
use crate::store::{retry_transient, Store};

/// Log written to a build stopped by an operator or by shutdown.
pub const INTERRUPTED_MESSAGE: &str = "Build interrupted.";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRequest {
    pub job: String,
    pub source: String,
    #[serde(default)]
    pub commit: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    /// Free-form reason, recorded as the grade ledger description
    #[serde(default = "default_trigger")]
    pub trigger: String,
}

fn default_trigger() -> String {
    "Manual submission".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Submission {
    pub build_name: String,
    pub admitted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Producer side of the pipeline: persists builds, applies admission
/// control and feeds the dispatch queue. Also stops builds.
#[derive(Clone)]
pub struct GraderService {
    store: Store,
    queue: Arc<DispatchQueue>,
    admission: Arc<AdmissionController>,
    policy: Arc<dyn PolicyLookup>,
    cancels: Arc<CancelRegistry>,
}

impl GraderService {
    pub fn new(
        store: Store,
        queue: Arc<DispatchQueue>,
        admission: AdmissionController,
        policy: Arc<dyn PolicyLookup>,
        cancels: Arc<CancelRegistry>,
    ) -> Self {
        Self {
            store,
            queue,
            admission: Arc::new(admission),
            policy,
            cancels,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn queue(&self) -> &Arc<DispatchQueue> {
        &self.queue
    }

    /// Create a build and, if admitted, dispatch it. A rejected build is still
    /// persisted, already FAILED with the rejection message as its log.
    pub async fn submit(&self, request: BuildRequest) -> Result<Submission> {
        let assignment = self
            .policy
            .assignment(&request.job)
            .ok_or_else(|| GraderError::UnknownAssignment(request.job.clone()))?;

        let (build_name, admission) = retry_transient("submit build", || {
            self.store.transaction(|tx| {
                let name = builds::create_build(
                    tx,
                    &request.job,
                    &request.source,
                    request.commit.as_deref(),
                    request.message.as_deref(),
                )?;
                let admission = self.admission.check(tx, &request.source, &request.job)?;
                if let Admission::Rejected(ref reason) = admission {
                    builds::fail_build(tx, &name, reason, &[BuildStatus::Queued])?;
                }
                Ok::<_, GraderError>((name, admission))
            })
        })
        .await?;

        match admission {
            Admission::Admitted => {
                tracing::info!(build = %build_name, source = %request.source, "Build submitted");
                self.queue.enqueue(Job::new(
                    build_name.clone(),
                    request.source,
                    request.trigger,
                    assignment.graded,
                ));
                Ok(Submission {
                    build_name,
                    admitted: true,
                    reason: None,
                })
            }
            Admission::Rejected(reason) => Ok(Submission {
                build_name,
                admitted: false,
                reason: Some(reason),
            }),
        }
    }

    /// Move a queued or running build to FAILED and interrupt its worker.
    /// Returns false when the build had already finished.
    pub async fn stop(&self, build_name: &str) -> Result<bool> {
        let stopped = retry_transient("stop build", || {
            self.store.transaction(|tx| {
                if builds::get_build(tx, build_name)?.is_none() {
                    return Err(GraderError::BuildNotFound(build_name.to_string()));
                }
                let changed = builds::fail_build(
                    tx,
                    build_name,
                    INTERRUPTED_MESSAGE,
                    &[BuildStatus::Queued, BuildStatus::InProgress],
                )?;
                Ok(changed)
            })
        })
        .await?;

        if stopped {
            let interrupted = self.cancels.cancel(build_name);
            tracing::info!(build = %build_name, interrupted, "Build stopped");
        }
        Ok(stopped)
    }

    pub fn build(&self, build_name: &str) -> Result<Option<Build>> {
        Ok(self.store.read(|conn| builds::get_build(conn, build_name))?)
    }

    pub fn recent_builds(&self, source: Option<&str>, limit: u32) -> Result<Vec<Build>> {
        Ok(self
            .store
            .read(|conn| builds::list_builds(conn, source, limit))?)
    }
}
