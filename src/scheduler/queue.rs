use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Notify;

use crate::scheduler::job::Job;
use crate::scheduler::registry::{WorkerProbe, WorkerRegistry, WorkerStatus};

/// In-memory FIFO from producers to the worker pool, plus the registry of
/// workers consuming it.
///
/// The queue is not persisted. A build whose job is lost here is still
/// QUEUED in the store and gets swept to FAILED at the next startup.
#[derive(Debug, Default)]
pub struct DispatchQueue {
    jobs: Mutex<VecDeque<Job>>,
    ready: Notify,
    workers: WorkerRegistry,
}

impl DispatchQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn jobs(&self) -> MutexGuard<'_, VecDeque<Job>> {
        match self.jobs.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn enqueue(&self, job: Job) {
        tracing::debug!(build = %job.build_name, source = %job.source, "Job enqueued");
        self.jobs().push_back(job);
        self.ready.notify_one();
    }

    /// Wait until a job is available and take it. Each job goes to exactly
    /// one caller.
    pub async fn dequeue(&self) -> Job {
        loop {
            if let Some(job) = self.try_dequeue() {
                return job;
            }
            self.ready.notified().await;
        }
    }

    pub fn try_dequeue(&self) -> Option<Job> {
        let job = self.jobs().pop_front();
        // Pass the wakeup on if more work is waiting behind this job.
        if job.is_some() && !self.jobs().is_empty() {
            self.ready.notify_one();
        }
        job
    }

    pub fn len(&self) -> usize {
        self.jobs().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs().is_empty()
    }

    /// Copy of the queued jobs, head first.
    pub fn snapshot(&self) -> Vec<Job> {
        self.jobs().iter().cloned().collect()
    }

    pub fn register_worker(&self) -> Arc<WorkerStatus> {
        self.workers.register()
    }

    pub fn probe_worker(&self, id: u64, with_log: bool) -> Option<WorkerProbe> {
        self.workers.get(id).map(|w| w.probe(with_log))
    }

    pub fn probe_workers(&self, with_log: bool) -> Vec<WorkerProbe> {
        self.workers.probe_all(with_log)
    }
}
