//! Durable job log and the mailer queue built on it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use gradebox::config::MailerConfig;
use gradebox::error::{GraderError, Result};
use gradebox::journal::{DurableQueue, JobProcessor};
use gradebox::notify::mailer::SEND_OPERATION;
use gradebox::notify::{MailNotifier, Mailer, Notification, Notifier, SpoolTransport};
use gradebox::store::Store;

#[derive(Clone, Default)]
struct RecordingProcessor {
    seen: Arc<Mutex<Vec<(String, Value)>>>,
}

impl RecordingProcessor {
    fn seen(&self) -> Vec<(String, Value)> {
        self.seen.lock().unwrap().clone()
    }
}

impl JobProcessor for RecordingProcessor {
    fn queue_name(&self) -> &'static str {
        "test_queue"
    }

    async fn process_job(&self, operation: &str, payload: &Value) -> Result<()> {
        if operation == "explode" {
            return Err(GraderError::Internal("processor failed".to_string()));
        }
        self.seen
            .lock()
            .unwrap()
            .push((operation.to_string(), payload.clone()));
        Ok(())
    }
}

fn open(dir: &TempDir) -> Store {
    Store::open(dir.path().join("journal.db")).unwrap()
}

fn create(queue: &DurableQueue<RecordingProcessor>, store: &Store, operation: &str, payload: Value) {
    let handle = store
        .transaction(|tx| queue.create(tx, operation, &payload))
        .unwrap();
    queue.enqueue(handle);
}

#[tokio::test]
async fn test_entry_from_rolled_back_transaction_disappears() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir);
    let queue = DurableQueue::new(store.clone(), RecordingProcessor::default()).unwrap();

    let result: Result<()> = store.transaction(|tx| {
        queue.create(tx, "send", &json!({"n": 1}))?;
        Err(GraderError::Internal("caller gave up".to_string()))
    });
    assert!(result.is_err());
    assert!(queue.entries().unwrap().is_empty());
}

#[tokio::test]
async fn test_processed_entry_is_marked_complete() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir);
    let processor = RecordingProcessor::default();
    let queue = DurableQueue::new(store.clone(), processor.clone()).unwrap();

    create(&queue, &store, "send", json!({"to": "ab"}));
    assert_eq!(queue.pending_len(), 1);
    assert_eq!(queue.drain().await, 1);

    assert_eq!(processor.seen(), vec![("send".to_string(), json!({"to": "ab"}))]);
    let entries = queue.entries().unwrap();
    assert_eq!(entries.len(), 1);
    assert!(entries[0].completed);
    assert_eq!(entries[0].operation, "send");
}

#[tokio::test]
async fn test_recover_replays_incomplete_entries_in_order() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir);
    {
        // A previous process that crashed before processing anything
        let queue = DurableQueue::new(store.clone(), RecordingProcessor::default()).unwrap();
        for n in 1..=3 {
            create(&queue, &store, "send", json!({ "n": n }));
        }
    }

    let processor = RecordingProcessor::default();
    let queue = DurableQueue::new(store.clone(), processor.clone()).unwrap();
    assert_eq!(queue.recover().unwrap(), 3);
    assert_eq!(queue.drain().await, 3);

    let order: Vec<Value> = processor.seen().into_iter().map(|(_, p)| p["n"].clone()).collect();
    assert_eq!(order, vec![json!(1), json!(2), json!(3)]);
    assert!(queue.entries().unwrap().iter().all(|e| e.completed));

    // Only once per process
    assert!(queue.recover().is_err());
}

#[tokio::test]
async fn test_completed_entries_are_not_recovered() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir);
    {
        let queue = DurableQueue::new(store.clone(), RecordingProcessor::default()).unwrap();
        create(&queue, &store, "send", json!({"n": 1}));
        queue.drain().await;
        create(&queue, &store, "send", json!({"n": 2}));
    }

    let queue = DurableQueue::new(store.clone(), RecordingProcessor::default()).unwrap();
    assert_eq!(queue.recover().unwrap(), 1);
}

#[tokio::test]
async fn test_failed_entry_stays_incomplete() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir);
    let processor = RecordingProcessor::default();
    let queue = DurableQueue::new(store.clone(), processor.clone()).unwrap();

    create(&queue, &store, "explode", json!({}));
    create(&queue, &store, "send", json!({"n": 2}));
    assert_eq!(queue.drain().await, 1);

    let entries = queue.entries().unwrap();
    assert!(!entries[0].completed);
    assert!(entries[1].completed);
    // Kept for another attempt
    assert_eq!(queue.pending_len(), 1);
}

#[tokio::test]
async fn test_runner_processes_until_shutdown() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir);
    let processor = RecordingProcessor::default();
    let queue = Arc::new(DurableQueue::new(store.clone(), processor.clone()).unwrap());

    let shutdown = CancellationToken::new();
    let runner = {
        let queue = queue.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { queue.run(shutdown).await })
    };

    create(&queue, &store, "send", json!({"n": 1}));
    create(&queue, &store, "send", json!({"n": 2}));

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while processor.seen().len() < 2 {
        assert!(tokio::time::Instant::now() < deadline, "runner did not process entries");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    shutdown.cancel();
    runner.await.unwrap();
}

#[tokio::test]
async fn test_invalid_queue_name_is_rejected() {
    #[derive(Clone)]
    struct BadName;

    impl JobProcessor for BadName {
        fn queue_name(&self) -> &'static str {
            "drop table"
        }

        async fn process_job(&self, _operation: &str, _payload: &Value) -> Result<()> {
            Ok(())
        }
    }

    let store = Store::open_in_memory().unwrap();
    assert!(DurableQueue::new(store, BadName).is_err());
}

// =============================================================================
// Mailer
// =============================================================================

fn mailer_config() -> MailerConfig {
    let mut addresses = HashMap::new();
    addresses.insert("ab".to_string(), "ab@example.edu".to_string());
    MailerConfig {
        enabled: true,
        spool_dir: None,
        from: "grader@example.edu".to_string(),
        operator_address: Some("ops@example.edu".to_string()),
        addresses,
    }
}

#[tokio::test]
async fn test_mail_is_spooled_once_processed() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir);
    let spool = dir.path().join("spool");
    let queue = Arc::new(
        DurableQueue::new(store.clone(), Mailer::new(SpoolTransport::new(&spool))).unwrap(),
    );
    let notifier = MailNotifier::new(store.clone(), queue.clone(), mailer_config());

    let mail = notifier
        .queue_mail(Notification::to_user(
            "ab",
            "hw1-build-3 complete - score 10 / 10",
            "All tests passed",
        ))
        .unwrap()
        .expect("ab has an address");
    assert_eq!(mail.to, "ab@example.edu");
    assert_eq!(mail.from, "grader@example.edu");

    assert_eq!(queue.drain().await, 1);
    let path = queue.processor().transport().path_for(&mail.message_id);
    let written = std::fs::read_to_string(path).unwrap();
    assert!(written.contains("To: ab@example.edu"));
    assert!(written.contains("Subject: hw1-build-3 complete - score 10 / 10"));
    assert!(written.contains("All tests passed"));
}

#[tokio::test]
async fn test_mail_replayed_after_crash_is_spooled_once() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir);
    let spool = dir.path().join("spool");

    let (mail, first_write) = {
        // Delivered, then the process died before marking the entry complete
        let queue = Arc::new(
            DurableQueue::new(store.clone(), Mailer::new(SpoolTransport::new(&spool))).unwrap(),
        );
        let notifier = MailNotifier::new(store.clone(), queue.clone(), mailer_config());
        let mail = notifier
            .queue_mail(Notification::to_user("ab", "hw1-build-4 failed", "Compilation error"))
            .unwrap()
            .expect("ab has an address");
        queue
            .processor()
            .process_job(SEND_OPERATION, &serde_json::to_value(&mail).unwrap())
            .await
            .unwrap();
        let path = queue.processor().transport().path_for(&mail.message_id);
        (mail, std::fs::read_to_string(path).unwrap())
    };

    let queue =
        DurableQueue::new(store.clone(), Mailer::new(SpoolTransport::new(&spool))).unwrap();
    assert_eq!(queue.recover().unwrap(), 1);
    assert_eq!(queue.drain().await, 1);
    assert!(queue.entries().unwrap().iter().all(|e| e.completed));

    let spooled: Vec<_> = std::fs::read_dir(&spool)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .collect();
    assert_eq!(spooled, vec![queue.processor().transport().path_for(&mail.message_id)]);
    assert_eq!(std::fs::read_to_string(&spooled[0]).unwrap(), first_write);
}

#[tokio::test]
async fn test_mail_without_address_is_not_queued() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir);
    let queue = Arc::new(
        DurableQueue::new(store.clone(), Mailer::new(SpoolTransport::new(dir.path()))).unwrap(),
    );
    let notifier = MailNotifier::new(store.clone(), queue.clone(), mailer_config());

    let queued = notifier
        .queue_mail(Notification::to_user("zz", "subject", "body"))
        .unwrap();
    assert!(queued.is_none());
    assert!(queue.entries().unwrap().is_empty());

    // Operators have their own address
    notifier.notify(Notification::to_operator("Critical failure in hw1-build-1", "boom"));
    assert_eq!(queue.entries().unwrap().len(), 1);
}

#[tokio::test]
async fn test_unknown_mailer_operation_is_completed() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir);
    let queue =
        DurableQueue::new(store.clone(), Mailer::new(SpoolTransport::new(dir.path()))).unwrap();

    let handle = store
        .transaction(|tx| queue.create(tx, "fax", &json!({})))
        .unwrap();
    queue.enqueue(handle);

    assert_eq!(queue.drain().await, 1);
    assert!(queue.entries().unwrap()[0].completed);
}
