//! Owner notifications.
//!
//! Workers hand a [`Notification`] to a [`Notifier`] and move on. Delivery is
//! somebody else's problem: [`MailNotifier`] persists the message into the
//! durable mailer queue and returns, the queue runner delivers it later.

pub mod mailer;
pub mod messages;

use serde::Serialize;

pub use mailer::{LogTransport, MailNotifier, MailTransport, Mailer, OutgoingMail, SpoolTransport};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Recipient {
    /// A student, by user id
    User(String),
    /// Whoever runs the grader
    Operator,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub recipient: Recipient,
    pub subject: String,
    pub body: String,
}

impl Notification {
    pub fn to_user(user: impl Into<String>, subject: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            recipient: Recipient::User(user.into()),
            subject: subject.into(),
            body: body.into(),
        }
    }

    pub fn to_operator(subject: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            recipient: Recipient::Operator,
            subject: subject.into(),
            body: body.into(),
        }
    }
}

/// Best-effort notification sink. Must return without waiting on delivery.
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Drops everything. Used when mail is disabled.
#[derive(Debug, Clone, Default)]
pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn notify(&self, notification: Notification) {
        tracing::debug!(
            recipient = ?notification.recipient,
            subject = %notification.subject,
            "Notification dropped (mailer disabled)"
        );
    }
}
