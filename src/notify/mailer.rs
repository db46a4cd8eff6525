use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::config::MailerConfig;
use crate::error::Result;
use crate::journal::{DurableQueue, JobProcessor};
use crate::notify::{Notification, Notifier, Recipient};
use crate::store::Store;

pub const MAILER_QUEUE: &str = "mailerqueue";
pub const SEND_OPERATION: &str = "send";

/// A rendered message as persisted in the mailer queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutgoingMail {
    /// Stable across replays, so transports can deduplicate
    pub message_id: String,
    pub from: String,
    pub to: String,
    pub subject: String,
    pub body: String,
}

impl OutgoingMail {
    pub fn render(&self) -> String {
        format!(
            "Message-ID: <{}>\nFrom: {}\nTo: {}\nSubject: {}\n\n{}\n",
            self.message_id, self.from, self.to, self.subject, self.body
        )
    }
}

/// Hands a message to whatever actually delivers mail.
pub trait MailTransport: Send + Sync + 'static {
    fn send(&self, mail: &OutgoingMail) -> impl Future<Output = Result<()>> + Send;
}

/// Logs every message instead of delivering it.
#[derive(Debug, Clone, Default)]
pub struct LogTransport;

impl MailTransport for LogTransport {
    async fn send(&self, mail: &OutgoingMail) -> Result<()> {
        tracing::info!(
            message_id = %mail.message_id,
            to = %mail.to,
            subject = %mail.subject,
            "Mail sent"
        );
        Ok(())
    }
}

/// Writes each message to `<dir>/<message_id>.eml`. Replays overwrite the
/// same file.
#[derive(Debug, Clone)]
pub struct SpoolTransport {
    dir: PathBuf,
}

impl SpoolTransport {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, message_id: &str) -> PathBuf {
        self.dir.join(format!("{}.eml", message_id))
    }
}

impl MailTransport for SpoolTransport {
    async fn send(&self, mail: &OutgoingMail) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(&mail.message_id);
        tokio::fs::write(&path, mail.render()).await?;
        tracing::debug!(path = %path.display(), to = %mail.to, "Mail spooled");
        Ok(())
    }
}

/// Processor of the mailer queue.
#[derive(Debug, Clone)]
pub struct Mailer<T> {
    transport: T,
}

impl<T: MailTransport> Mailer<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }
}

impl<T: MailTransport> JobProcessor for Mailer<T> {
    fn queue_name(&self) -> &'static str {
        MAILER_QUEUE
    }

    async fn process_job(&self, operation: &str, payload: &Value) -> Result<()> {
        match operation {
            SEND_OPERATION => {
                let mail: OutgoingMail = serde_json::from_value(payload.clone())?;
                self.transport.send(&mail).await
            }
            other => {
                tracing::warn!(queue = MAILER_QUEUE, operation = other, "Unknown operation, skipping");
                Ok(())
            }
        }
    }
}

/// [`Notifier`] backed by the durable mailer queue.
pub struct MailNotifier<T> {
    store: Store,
    queue: Arc<DurableQueue<Mailer<T>>>,
    config: MailerConfig,
}

impl<T: MailTransport> MailNotifier<T> {
    pub fn new(store: Store, queue: Arc<DurableQueue<Mailer<T>>>, config: MailerConfig) -> Self {
        Self {
            store,
            queue,
            config,
        }
    }

    fn address(&self, recipient: &Recipient) -> Option<String> {
        match recipient {
            Recipient::User(user) => self.config.addresses.get(user).cloned(),
            Recipient::Operator => self.config.operator_address.clone(),
        }
    }

    /// Persist `notification` and hand it to the runner. Returns the queued
    /// message, or `None` when the recipient has no address.
    pub fn queue_mail(&self, notification: Notification) -> Result<Option<OutgoingMail>> {
        let Some(to) = self.address(&notification.recipient) else {
            tracing::debug!(recipient = ?notification.recipient, "No mail address, not sending");
            return Ok(None);
        };
        let mail = OutgoingMail {
            message_id: Uuid::new_v4().to_string(),
            from: self.config.from.clone(),
            to,
            subject: notification.subject,
            body: notification.body,
        };
        let handle = self
            .store
            .transaction(|tx| self.queue.create(tx, SEND_OPERATION, &mail))?;
        self.queue.enqueue(handle);
        Ok(Some(mail))
    }
}

impl<T: MailTransport> Notifier for MailNotifier<T> {
    fn notify(&self, notification: Notification) {
        let subject = notification.subject.clone();
        if let Err(e) = self.queue_mail(notification) {
            tracing::error!(subject = %subject, error = %e, "Failed to queue notification");
        }
    }
}
