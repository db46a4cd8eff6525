use std::sync::Arc;

use serde::Serialize;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::GraderConfig;
use crate::dashboard::{run_dashboard, DashboardState};
use crate::error::Result;
use crate::grading::{AssignmentBook, ConfiguredOwners};
use crate::journal::DurableQueue;
use crate::notify::{
    LogTransport, MailNotifier, MailTransport, Mailer, Notifier, NullNotifier, SpoolTransport,
};
use crate::sandbox::Sandbox;
use crate::scheduler::{AdmissionController, CancelRegistry, DispatchQueue, GraderService};
use crate::store::builds::reset_unfinished;
use crate::store::{retry_transient, Store};
use crate::worker::{HandlerMap, HandlerResolver, ScriptHandler, Worker, WorkerContext};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResetReport {
    /// Builds swept from QUEUED/IN_PROGRESS to FAILED
    pub builds: usize,
    pub containers: usize,
    pub images: usize,
}

/// One grader process: store, dispatch queue, worker pool, mailer and dashboard.
pub struct GraderNode {
    config: GraderConfig,
    store: Store,
    queue: Arc<DispatchQueue>,
    sandbox: Sandbox,
    handlers: Arc<dyn HandlerResolver>,
    policy: Arc<AssignmentBook>,
    owners: Arc<ConfiguredOwners>,
    cancels: Arc<CancelRegistry>,
    service: GraderService,
    shutdown: CancellationToken,
}

impl GraderNode {
    pub fn new(
        config: GraderConfig,
        store: Store,
        sandbox: Sandbox,
        handlers: Arc<dyn HandlerResolver>,
        shutdown: CancellationToken,
    ) -> Self {
        let queue = Arc::new(DispatchQueue::new());
        let policy = Arc::new(AssignmentBook::new(config.assignments.clone()));
        let owners = Arc::new(ConfiguredOwners::new(config.owners.clone()));
        let cancels = Arc::new(CancelRegistry::new(shutdown.child_token()));
        let service = GraderService::new(
            store.clone(),
            queue.clone(),
            AdmissionController::new(config.admission.clone()),
            policy.clone(),
            cancels.clone(),
        );
        Self {
            config,
            store,
            queue,
            sandbox,
            handlers,
            policy,
            owners,
            cancels,
            service,
            shutdown,
        }
    }

    /// Node backed by the configured database and the docker CLI, grading
    /// every assignment with its configured script.
    pub fn from_config(config: GraderConfig, shutdown: CancellationToken) -> Result<Self> {
        config.validate()?;
        let store = Store::open(&config.database_path)?;
        let sandbox = Sandbox::docker(config.sandbox.clone());
        let handlers = Arc::new(HandlerMap::new().with_fallback(Arc::new(ScriptHandler::new())));
        Ok(Self::new(config, store, sandbox, handlers, shutdown))
    }

    pub fn service(&self) -> &GraderService {
        &self.service
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn queue(&self) -> &Arc<DispatchQueue> {
        &self.queue
    }

    /// Startup sweep. Nothing can be running before the workers start, so
    /// every unfinished build is failed and every sandbox container removed.
    pub async fn reset(&self) -> Result<ResetReport> {
        let builds = retry_transient("reset builds", || {
            Ok(self.store.transaction(|tx| reset_unfinished(tx))?)
        })
        .await?;
        if builds > 0 {
            tracing::warn!(builds, "Failed builds left unfinished by a previous run");
        }
        let cleaned = self.sandbox.clean().await?;
        Ok(ResetReport {
            builds,
            containers: cleaned.containers,
            images: cleaned.images,
        })
    }

    /// Reset, recover the mailer queue, start every task and wait for shutdown.
    pub async fn run(self) -> Result<()> {
        let report = self.reset().await?;
        tracing::info!(
            builds = report.builds,
            containers = report.containers,
            "Startup reset complete"
        );

        let mut tasks = JoinSet::new();
        let notifier = self.start_mailer(&mut tasks)?;

        let ctx = WorkerContext {
            store: self.store.clone(),
            queue: self.queue.clone(),
            sandbox: self.sandbox.clone(),
            handlers: self.handlers.clone(),
            policy: self.policy.clone(),
            owners: self.owners.clone(),
            notifier,
            cancels: self.cancels.clone(),
            slip: self.config.slip.clone(),
            dont_lower: self.config.use_max_score_build,
        };
        for _ in 0..self.config.workers {
            let worker = Worker::new(ctx.clone());
            tasks.spawn(worker.run(self.shutdown.clone()));
        }
        tracing::info!(workers = self.config.workers, "Worker pool started");

        if let Some(addr) = self.config.dashboard_addr {
            let state = DashboardState {
                service: self.service.clone(),
                queue: self.queue.clone(),
            };
            tasks.spawn(run_dashboard(addr, state, self.shutdown.clone()));
        }

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                Some(result) = tasks.join_next() => {
                    if let Err(e) = result {
                        tracing::error!(error = %e, "Node task exited abnormally");
                    }
                }
            }
        }

        tracing::info!("Shutting down, waiting for tasks");
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                tracing::error!(error = %e, "Node task exited abnormally");
            }
        }
        Ok(())
    }

    fn start_mailer(&self, tasks: &mut JoinSet<()>) -> Result<Arc<dyn Notifier>> {
        if !self.config.mailer.enabled {
            return Ok(Arc::new(NullNotifier));
        }
        match self.config.mailer.spool_dir.clone() {
            Some(dir) => self.spawn_mailer(SpoolTransport::new(dir), tasks),
            None => self.spawn_mailer(LogTransport, tasks),
        }
    }

    fn spawn_mailer<T: MailTransport>(
        &self,
        transport: T,
        tasks: &mut JoinSet<()>,
    ) -> Result<Arc<dyn Notifier>> {
        let queue = Arc::new(DurableQueue::new(self.store.clone(), Mailer::new(transport))?);
        let recovered = queue.recover()?;
        tracing::info!(queue = queue.name(), recovered, "Mailer queue ready");

        let runner = queue.clone();
        let shutdown = self.shutdown.clone();
        tasks.spawn(async move { runner.run(shutdown).await });

        Ok(Arc::new(MailNotifier::new(
            self.store.clone(),
            queue,
            self.config.mailer.clone(),
        )))
    }
}

impl std::fmt::Debug for GraderNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraderNode")
            .field("workers", &self.config.workers)
            .field("database", &self.config.database_path)
            .finish_non_exhaustive()
    }
}
