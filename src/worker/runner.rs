use std::any::Any;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::SlipConfig;
use crate::error::{GraderError, Result};
use crate::grading::{assign_grade_batch, slip_units, Assignment, GradeUpdate, OwnerResolver, PolicyLookup};
use crate::notify::messages;
use crate::notify::{Notification, Notifier};
use crate::sandbox::Sandbox;
use crate::scheduler::{CancelRegistry, DispatchQueue, Job, WorkerStatus, INTERRUPTED_MESSAGE};
use crate::store::builds::{self, Build, BuildStatus};
use crate::store::{retry_transient, Store};
use crate::worker::handler::{
    BuildContext, HandlerError, HandlerOutput, HandlerResolver, JobHandler,
};

/// Build log shown to students when something went wrong on our side.
pub const INTERNAL_ERROR_MESSAGE: &str = "Build failed due to an internal error.";

/// Ledger `source` for grades committed by workers.
pub const AUTOGRADER_SOURCE: &str = "autograder";

/// Everything a worker needs, shared by all workers of a node.
#[derive(Clone)]
pub struct WorkerContext {
    pub store: Store,
    pub queue: Arc<DispatchQueue>,
    pub sandbox: Sandbox,
    pub handlers: Arc<dyn HandlerResolver>,
    pub policy: Arc<dyn PolicyLookup>,
    pub owners: Arc<dyn OwnerResolver>,
    pub notifier: Arc<dyn Notifier>,
    pub cancels: Arc<CancelRegistry>,
    pub slip: SlipConfig,
    /// Autograder grades never lower a stored score
    pub dont_lower: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Expected,
    Critical,
    Timeout,
    Cancelled,
    Internal,
}

/// How a dequeued job ended, as far as this worker is concerned.
#[derive(Debug, Clone, PartialEq)]
pub enum BuildOutcome {
    /// The build was missing or no longer queued
    Skipped,
    Succeeded {
        score: f64,
        slip_units: i64,
        affected: Vec<String>,
    },
    Failed {
        kind: FailureKind,
        message: String,
    },
}

impl BuildOutcome {
    fn summary(&self) -> String {
        match self {
            BuildOutcome::Skipped => "skipped".to_string(),
            BuildOutcome::Succeeded { score, .. } => format!("success, score {}", score),
            BuildOutcome::Failed { kind, .. } => format!("failed ({:?})", kind),
        }
    }
}

pub struct Worker {
    ctx: WorkerContext,
    status: Arc<WorkerStatus>,
}

impl Worker {
    /// Registers a new worker with the dispatch queue.
    pub fn new(ctx: WorkerContext) -> Self {
        let status = ctx.queue.register_worker();
        Self { ctx, status }
    }

    pub fn id(&self) -> u64 {
        self.status.id()
    }

    pub fn status(&self) -> &Arc<WorkerStatus> {
        &self.status
    }

    /// Take jobs off the dispatch queue until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        let worker_id = self.id();
        tracing::info!(worker_id, "Worker started");
        loop {
            let job = tokio::select! {
                job = self.ctx.queue.dequeue() => job,
                _ = shutdown.cancelled() => break,
            };
            self.process(job).await;
        }
        tracing::info!(worker_id, "Worker stopped");
    }

    /// Run one job to a terminal state.
    pub async fn process(&self, job: Job) -> BuildOutcome {
        let name = job.build_name.clone();
        self.status.set_build(Some(&name));
        self.status.log(format!("Started {}", name), None);

        // Registered before the build is claimed so that a stop can never
        // fall between the two.
        let cancel = self.ctx.cancels.register(&name);
        let outcome = self.execute(&job, cancel).await;
        self.ctx.cancels.release(&name);

        tracing::info!(worker_id = self.id(), build = %name, outcome = %outcome.summary(), "Build finished");
        self.status.log(format!("Finished {}: {}", name, outcome.summary()), None);
        self.status.set_build(None);
        outcome
    }

    async fn execute(&self, job: &Job, cancel: CancellationToken) -> BuildOutcome {
        let claimed = retry_transient("start build", || {
            self.ctx
                .store
                .transaction(|tx| Ok::<_, GraderError>(builds::start_build(tx, &job.build_name)?))
        })
        .await;
        let build = match claimed {
            Ok(Some(build)) => build,
            Ok(None) => {
                tracing::info!(build = %job.build_name, "Build missing or not queued, skipping");
                return BuildOutcome::Skipped;
            }
            Err(e) => {
                return self
                    .internal_failure(
                        &job.build_name,
                        &[BuildStatus::Queued, BuildStatus::InProgress],
                        None,
                        format!("could not start build: {}", e),
                    )
                    .await;
            }
        };

        let owners = self.ctx.owners.owners(&build.source);
        let Some(assignment) = self.ctx.policy.assignment(&build.job) else {
            return self
                .internal_failure(
                    &build.name,
                    &[BuildStatus::InProgress],
                    Some(owners.as_slice()),
                    format!("unknown assignment {}", build.job),
                )
                .await;
        };
        let assignment = assignment.student_view(&build.source);
        let Some(handler) = self.ctx.handlers.resolve(&build.job) else {
            return self
                .internal_failure(
                    &build.name,
                    &[BuildStatus::InProgress],
                    Some(owners.as_slice()),
                    format!("no handler for job {}", build.job),
                )
                .await;
        };

        let ctx = BuildContext {
            build_name: build.name.clone(),
            source: build.source.clone(),
            commit: build.commit.clone(),
            assignment,
            sandbox: self.ctx.sandbox.clone(),
            cancel: cancel.clone(),
        };
        let result = run_handler(handler, &ctx).await;

        match result {
            Ok(output) => {
                if !ctx.assignment.accepts_score(output.score) {
                    let detail = format!(
                        "score {} outside [{}, {}]",
                        output.score, ctx.assignment.min_score, ctx.assignment.max_score
                    );
                    return self
                        .internal_failure(&build.name, &[BuildStatus::InProgress], Some(owners.as_slice()), detail)
                        .await;
                }
                self.commit_success(job, &build, &ctx.assignment, &owners, output)
                    .await
            }
            Err(HandlerError::Failed { message, critical }) => {
                let kind = if critical {
                    FailureKind::Critical
                } else {
                    FailureKind::Expected
                };
                self.student_failure(&build, &owners, kind, message).await
            }
            Err(HandlerError::Timeout(after)) => {
                let message = format!("Build timed out after {}s.", after.as_secs_f64());
                self.student_failure(&build, &owners, FailureKind::Timeout, message)
                    .await
            }
            Err(HandlerError::Cancelled) => {
                // Usually already FAILED by whoever stopped the build.
                if let Err(e) = self
                    .persist_failure(&build.name, INTERRUPTED_MESSAGE, &[BuildStatus::InProgress])
                    .await
                {
                    tracing::error!(build = %build.name, error = %e, "Failed to record interrupted build");
                }
                BuildOutcome::Failed {
                    kind: FailureKind::Cancelled,
                    message: INTERRUPTED_MESSAGE.to_string(),
                }
            }
            Err(HandlerError::Internal(detail)) => {
                self.internal_failure(&build.name, &[BuildStatus::InProgress], Some(owners.as_slice()), detail)
                    .await
            }
        }
    }

    async fn commit_success(
        &self,
        job: &Job,
        build: &Build,
        assignment: &Assignment,
        owners: &[String],
        output: HandlerOutput,
    ) -> BuildOutcome {
        let slip = slip_units(assignment.due_date, build.started, &self.ctx.slip);
        let committed = retry_transient("complete build", || {
            self.ctx.store.transaction(|tx| {
                if !builds::complete_build(tx, &build.name, output.score, &output.log)? {
                    return Ok(None);
                }
                if !job.graded {
                    return Ok(Some(Vec::new()));
                }
                let update = GradeUpdate {
                    users: owners,
                    assignment: &build.job,
                    score: Some(output.score),
                    slip_units: Some(slip),
                    transaction_name: &build.name,
                    description: &job.trigger,
                    source: AUTOGRADER_SOURCE,
                    manual: false,
                    dont_lower: self.ctx.dont_lower,
                };
                let affected = assign_grade_batch(tx, self.ctx.policy.as_ref(), &update)?;
                Ok::<_, GraderError>(Some(affected))
            })
        })
        .await;

        let affected = match committed {
            Ok(Some(affected)) => affected,
            Ok(None) => {
                tracing::info!(build = %build.name, "Build was stopped before it could complete");
                return BuildOutcome::Failed {
                    kind: FailureKind::Cancelled,
                    message: INTERRUPTED_MESSAGE.to_string(),
                };
            }
            Err(e) => {
                return self
                    .internal_failure(
                        &build.name,
                        &[BuildStatus::InProgress],
                        Some(owners),
                        format!("could not commit result: {}", e),
                    )
                    .await;
            }
        };

        for owner in owners {
            let subject = messages::build_complete_subject(
                &build.name,
                output.score,
                assignment.full_score,
                affected.contains(owner),
                slip,
                &self.ctx.slip,
            );
            self.ctx
                .notifier
                .notify(Notification::to_user(owner.clone(), subject, output.log.clone()));
        }

        BuildOutcome::Succeeded {
            score: output.score,
            slip_units: slip,
            affected,
        }
    }

    /// Expected, critical and timeout failures: the message is the build log
    /// and goes to every owner.
    async fn student_failure(
        &self,
        build: &Build,
        owners: &[String],
        kind: FailureKind,
        message: String,
    ) -> BuildOutcome {
        match self
            .persist_failure(&build.name, &message, &[BuildStatus::InProgress])
            .await
        {
            Ok(true) => {
                self.notify_failure(&build.name, owners, &message);
                if kind == FailureKind::Critical {
                    tracing::error!(build = %build.name, message = %message, "Critical build failure");
                    self.status
                        .log(format!("Critical failure in {}", build.name), Some(message.clone()));
                    self.ctx.notifier.notify(Notification::to_operator(
                        messages::critical_failure_subject(&build.name),
                        message.clone(),
                    ));
                }
            }
            Ok(false) => {
                tracing::info!(build = %build.name, "Build was stopped before its failure was recorded");
            }
            Err(e) => {
                tracing::error!(build = %build.name, error = %e, "Failed to record build failure");
            }
        }
        BuildOutcome::Failed { kind, message }
    }

    /// Detail goes to the server log and the worker log, never to the student.
    async fn internal_failure(
        &self,
        build_name: &str,
        from: &[BuildStatus],
        owners: Option<&[String]>,
        detail: String,
    ) -> BuildOutcome {
        tracing::error!(worker_id = self.id(), build = %build_name, detail = %detail, "Internal error while grading");
        self.status
            .log(format!("Internal error in {}", build_name), Some(detail));

        match self
            .persist_failure(build_name, INTERNAL_ERROR_MESSAGE, from)
            .await
        {
            Ok(true) => {
                if let Some(owners) = owners {
                    self.notify_failure(build_name, owners, INTERNAL_ERROR_MESSAGE);
                }
            }
            Ok(false) => {}
            Err(e) => {
                tracing::error!(build = %build_name, error = %e, "Failed to record internal error");
            }
        }
        BuildOutcome::Failed {
            kind: FailureKind::Internal,
            message: INTERNAL_ERROR_MESSAGE.to_string(),
        }
    }

    async fn persist_failure(&self, build_name: &str, log: &str, from: &[BuildStatus]) -> Result<bool> {
        retry_transient("fail build", || {
            Ok(self
                .ctx
                .store
                .transaction(|tx| builds::fail_build(tx, build_name, log, from))?)
        })
        .await
    }

    fn notify_failure(&self, build_name: &str, owners: &[String], message: &str) {
        for owner in owners {
            self.ctx.notifier.notify(Notification::to_user(
                owner.clone(),
                messages::build_failed_subject(build_name),
                message,
            ));
        }
    }
}

/// Run `handler` on its own task so a panic fails the build instead of the
/// worker. On cancellation the task is aborted and awaited, which drops its
/// containers before this returns.
async fn run_handler(
    handler: Arc<dyn JobHandler>,
    ctx: &BuildContext,
) -> std::result::Result<HandlerOutput, HandlerError> {
    let task_ctx = ctx.clone();
    let mut grading = tokio::spawn(async move { handler.grade(&task_ctx).await });

    let joined = tokio::select! {
        joined = &mut grading => Some(joined),
        _ = ctx.cancel.cancelled() => None,
    };
    match joined {
        Some(Ok(result)) => result,
        Some(Err(e)) if e.is_panic() => Err(HandlerError::Internal(format!(
            "grading handler panicked: {}",
            panic_detail(e.into_panic())
        ))),
        Some(Err(e)) => Err(HandlerError::Internal(format!("grading task failed: {}", e))),
        None => {
            grading.abort();
            let _ = grading.await;
            Err(HandlerError::Cancelled)
        }
    }
}

fn panic_detail(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
