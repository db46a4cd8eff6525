//! Durable job log: a queue whose entries survive restarts.
//!
//! An entry is written with [`DurableQueue::create`] inside the same transaction as
//! the change that motivated it, handed to the in-memory runner with
//! [`DurableQueue::enqueue`] once that transaction has committed, and marked
//! complete only after [`JobProcessor::process_job`] succeeds. Anything left
//! incomplete by a crash is picked up again by [`DurableQueue::recover`] at the
//! next startup, so delivery is at-least-once and processors must be idempotent.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::error::{GraderError, Result};
use crate::store::{next_counter, now_str, parse_timestamp, Store, StoreError};

const FAILURE_INITIAL_DELAY: Duration = Duration::from_millis(10);
const FAILURE_MAX_DELAY: Duration = Duration::from_secs(30);
const COMPLETE_MAX_DELAY: Duration = Duration::from_secs(1);

/// Work performed for each entry of one durable queue.
pub trait JobProcessor: Send + Sync + 'static {
    /// Names the queue; doubles as its table name, so keep it `[a-z_]+`.
    fn queue_name(&self) -> &'static str;

    /// Must be idempotent: a crash between success and completion replays it.
    fn process_job(
        &self,
        operation: &str,
        payload: &Value,
    ) -> impl Future<Output = Result<()>> + Send;
}

/// Opaque reference to a created entry, passed from `create` to `enqueue`.
#[derive(Debug, Clone, PartialEq)]
pub struct JobHandle {
    pub id: i64,
    pub operation: String,
    pub payload: Value,
}

/// A persisted row of a durable queue.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueEntry {
    pub id: i64,
    pub operation: String,
    pub payload: String,
    pub updated: DateTime<Utc>,
    pub completed: bool,
}

pub struct DurableQueue<P> {
    name: &'static str,
    store: Store,
    processor: P,
    pending: Mutex<VecDeque<JobHandle>>,
    ready: Notify,
    recovered: AtomicBool,
}

impl<P: JobProcessor> DurableQueue<P> {
    pub fn new(store: Store, processor: P) -> Result<Self> {
        let name = processor.queue_name();
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_lowercase() || c == '_') {
            return Err(GraderError::Config(format!("invalid queue name {:?}", name)));
        }
        store.transaction(|tx| {
            tx.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {} (
                   id INTEGER PRIMARY KEY,
                   operation TEXT NOT NULL,
                   payload TEXT NOT NULL,
                   updated TEXT NOT NULL,
                   completed INTEGER NOT NULL DEFAULT 0
                 )",
                name
            ))
            .map_err(StoreError::from)
        })?;
        Ok(Self {
            name,
            store,
            processor,
            pending: Mutex::new(VecDeque::new()),
            ready: Notify::new(),
            recovered: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn processor(&self) -> &P {
        &self.processor
    }

    /// Insert a new entry as part of the caller's open transaction. If that
    /// transaction rolls back, the entry disappears with it.
    pub fn create(
        &self,
        conn: &Connection,
        operation: &str,
        payload: &impl Serialize,
    ) -> Result<JobHandle> {
        let payload = serde_json::to_value(payload)?;
        let id = next_counter(conn, &format!("{}_next_transaction_id", self.name))?;
        conn.execute(
            &format!(
                "INSERT INTO {} (id, operation, payload, updated, completed)
                 VALUES (?1, ?2, ?3, ?4, 0)",
                self.name
            ),
            params![id, operation, payload.to_string(), now_str()],
        )?;
        Ok(JobHandle {
            id,
            operation: operation.to_string(),
            payload,
        })
    }

    /// Hand a committed entry to the runner.
    pub fn enqueue(&self, handle: JobHandle) {
        self.push(handle);
        self.ready.notify_one();
    }

    /// Re-enqueue every incomplete entry, oldest id first. Only valid once per
    /// process lifetime.
    pub fn recover(&self) -> Result<usize> {
        if self.recovered.swap(true, Ordering::SeqCst) {
            return Err(GraderError::Internal(format!(
                "queue {} was already recovered",
                self.name
            )));
        }
        let entries = self.store.read(|conn| incomplete_entries(conn, self.name))?;
        let count = entries.len();
        for entry in entries {
            let payload = serde_json::from_str(&entry.payload)?;
            self.push(JobHandle {
                id: entry.id,
                operation: entry.operation,
                payload,
            });
        }
        if count > 0 {
            tracing::info!(queue = self.name, count, "Recovered incomplete queue entries");
            self.ready.notify_one();
        }
        Ok(count)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().map(|q| q.len()).unwrap_or(0)
    }

    /// Every persisted entry, for inspection.
    pub fn entries(&self) -> Result<Vec<QueueEntry>> {
        let entries = self.store.read(|conn| all_entries(conn, self.name))?;
        Ok(entries)
    }

    /// Consume entries until `shutdown` is cancelled. One runner per queue.
    pub async fn run(&self, shutdown: CancellationToken) {
        tracing::info!(queue = self.name, "Queue runner started");
        let mut failure_delay = FAILURE_INITIAL_DELAY;

        loop {
            let handle = match self.pop() {
                Some(handle) => handle,
                None => {
                    tokio::select! {
                        _ = self.ready.notified() => {}
                        _ = shutdown.cancelled() => break,
                    }
                    continue;
                }
            };

            match self
                .processor
                .process_job(&handle.operation, &handle.payload)
                .await
            {
                Ok(()) => {
                    failure_delay = FAILURE_INITIAL_DELAY;
                    self.mark_complete(handle.id).await;
                }
                Err(e) => {
                    tracing::error!(
                        queue = self.name,
                        id = handle.id,
                        operation = %handle.operation,
                        error = %e,
                        "Error occurred while processing queue entry"
                    );
                    // Stays incomplete; try again after the rest of the queue.
                    self.push(handle);
                    tokio::select! {
                        _ = tokio::time::sleep(failure_delay) => {}
                        _ = shutdown.cancelled() => break,
                    }
                    failure_delay = (failure_delay * 2).min(FAILURE_MAX_DELAY);
                }
            }
        }
        tracing::info!(queue = self.name, "Queue runner stopped");
    }

    /// Process whatever is pending right now, without waiting for more.
    /// Returns the number of entries completed.
    pub async fn drain(&self) -> usize {
        let mut completed = 0;
        let mut attempts = self.pending_len();
        while attempts > 0 {
            attempts -= 1;
            let Some(handle) = self.pop() else { break };
            match self
                .processor
                .process_job(&handle.operation, &handle.payload)
                .await
            {
                Ok(()) => {
                    self.mark_complete(handle.id).await;
                    completed += 1;
                }
                Err(e) => {
                    tracing::error!(queue = self.name, id = handle.id, error = %e, "Queue entry failed");
                    self.push(handle);
                }
            }
        }
        completed
    }

    /// Set `completed = 1`, retrying until the store accepts it.
    pub async fn mark_complete(&self, id: i64) {
        let mut delay = FAILURE_INITIAL_DELAY;
        loop {
            let result: std::result::Result<usize, StoreError> = self.store.transaction(|tx| {
                Ok(tx.execute(
                    &format!(
                        "UPDATE {} SET completed = 1, updated = ?1 WHERE id = ?2",
                        self.name
                    ),
                    params![now_str(), id],
                )?)
            });
            match result {
                Ok(_) => return,
                Err(e) => {
                    tracing::error!(queue = self.name, id, error = %e, "Error occurred while marking entry done");
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(COMPLETE_MAX_DELAY);
                }
            }
        }
    }

    fn push(&self, handle: JobHandle) {
        match self.pending.lock() {
            Ok(mut queue) => queue.push_back(handle),
            Err(poisoned) => poisoned.into_inner().push_back(handle),
        }
    }

    fn pop(&self) -> Option<JobHandle> {
        match self.pending.lock() {
            Ok(mut queue) => queue.pop_front(),
            Err(poisoned) => poisoned.into_inner().pop_front(),
        }
    }
}

fn incomplete_entries(conn: &Connection, table: &str) -> std::result::Result<Vec<QueueEntry>, StoreError> {
    query_entries(conn, table, "WHERE completed = 0")
}

fn all_entries(conn: &Connection, table: &str) -> std::result::Result<Vec<QueueEntry>, StoreError> {
    query_entries(conn, table, "")
}

fn query_entries(
    conn: &Connection,
    table: &str,
    filter: &str,
) -> std::result::Result<Vec<QueueEntry>, StoreError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT id, operation, payload, updated, completed FROM {} {} ORDER BY id ASC",
        table, filter
    ))?;
    let mut rows = stmt.query([])?;
    let mut entries = Vec::new();
    while let Some(row) = rows.next()? {
        let updated: String = row.get(3)?;
        entries.push(QueueEntry {
            id: row.get(0)?,
            operation: row.get(1)?,
            payload: row.get(2)?,
            updated: parse_timestamp(&updated)?,
            completed: row.get::<_, i64>(4)? != 0,
        });
    }
    Ok(entries)
}
