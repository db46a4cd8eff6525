use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Entries kept per worker; older ones are dropped.
pub const WORKER_LOG_CAPACITY: usize = 100;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerLogEntry {
    pub at: DateTime<Utc>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Worker state tracking
#[derive(Debug, Clone)]
struct WorkerState {
    id: u64,
    current_build: Option<String>,
    updated: DateTime<Utc>,
    log: VecDeque<WorkerLogEntry>,
}

/// Point-in-time copy of a worker's state, safe to hand to the dashboard.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerProbe {
    pub id: u64,
    pub current_build: Option<String>,
    pub updated: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log: Option<Vec<WorkerLogEntry>>,
}

/// Shared handle to one worker's status. The worker writes, probes read.
#[derive(Debug)]
pub struct WorkerStatus {
    state: Mutex<WorkerState>,
}

impl WorkerStatus {
    fn new(id: u64) -> Self {
        Self {
            state: Mutex::new(WorkerState {
                id,
                current_build: None,
                updated: Utc::now(),
                log: VecDeque::with_capacity(WORKER_LOG_CAPACITY),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, WorkerState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn id(&self) -> u64 {
        self.lock().id
    }

    pub fn current_build(&self) -> Option<String> {
        self.lock().current_build.clone()
    }

    pub fn set_build(&self, build: Option<&str>) {
        let mut state = self.lock();
        state.current_build = build.map(str::to_string);
        state.updated = Utc::now();
    }

    pub fn log(&self, message: impl Into<String>, detail: Option<String>) {
        let mut state = self.lock();
        if state.log.len() == WORKER_LOG_CAPACITY {
            state.log.pop_front();
        }
        state.log.push_back(WorkerLogEntry {
            at: Utc::now(),
            message: message.into(),
            detail,
        });
    }

    pub fn probe(&self, with_log: bool) -> WorkerProbe {
        let state = self.lock();
        WorkerProbe {
            id: state.id,
            current_build: state.current_build.clone(),
            updated: state.updated,
            log: with_log.then(|| state.log.iter().cloned().collect()),
        }
    }
}

/// All workers of this process, in registration order.
#[derive(Debug, Default)]
pub struct WorkerRegistry {
    workers: Mutex<Vec<Arc<WorkerStatus>>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new worker. Ids start at 1.
    pub fn register(&self) -> Arc<WorkerStatus> {
        let mut workers = match self.workers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let status = Arc::new(WorkerStatus::new(workers.len() as u64 + 1));
        workers.push(status.clone());
        tracing::info!(worker_id = workers.len(), "Worker registered");
        status
    }

    pub fn get(&self, id: u64) -> Option<Arc<WorkerStatus>> {
        let workers = self.workers.lock().ok()?;
        let index = usize::try_from(id).ok()?.checked_sub(1)?;
        workers.get(index).cloned()
    }

    /// Snapshot of every worker. The list lock is released before any
    /// per-worker lock is taken.
    pub fn probe_all(&self, with_log: bool) -> Vec<WorkerProbe> {
        let workers: Vec<Arc<WorkerStatus>> = match self.workers.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        workers.iter().map(|w| w.probe(with_log)).collect()
    }
}
