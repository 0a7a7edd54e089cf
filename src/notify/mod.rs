//! Fire-and-forget notifications.
//!
//! - `NotificationPublisher`: provisions the durable notification queue and
//!   publishes persistent messages. No reply is expected.
//! - `NotificationConsumer`: drains the queue and hands each message to a
//!   `MailTransport`. Failed deliveries are requeued for another attempt.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::broker::BrokerError;

pub mod consumer;
pub mod publisher;
pub mod transport;

pub use consumer::{NotificationConsumer, NotificationConsumerConfig};
pub use publisher::NotificationPublisher;
pub use transport::{LogTransport, WebhookTransport};

/// Notification message body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    /// Recipient address.
    pub email: String,
    pub subject: String,
    /// Free-form extra data; producers commonly send `"null"`.
    #[serde(default)]
    pub other: Option<String>,
    pub body: String,
}

impl Notification {
    pub fn new(
        email: impl Into<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            email: email.into(),
            subject: subject.into(),
            other: None,
            body: body.into(),
        }
    }

    pub fn recipient(&self) -> &str {
        &self.email
    }
}

/// Errors from publishing a notification.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("Failed to encode notification: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Errors from a mail transport.
///
/// The consumer requeues every variant alike. The split between
/// `Rejected` and `Unavailable` only labels failures in logs, so an
/// operator can tell a refusing relay from a down one.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Transport configuration error: {0}")]
    Config(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Mail relay rejected message: {0}")]
    Rejected(String),

    #[error("Transport unavailable: {0}")]
    Unavailable(String),
}

impl TransportError {
    /// Whether the relay was unreachable or overloaded rather than refusing
    /// the message.
    pub fn is_transient(&self) -> bool {
        match self {
            TransportError::Unavailable(_) => true,
            TransportError::Http(e) => e.is_timeout() || e.is_connect(),
            TransportError::Config(_) | TransportError::Rejected(_) => false,
        }
    }
}

/// Side-effecting delivery of one notification (e.g. email).
#[async_trait]
pub trait MailTransport: Send + Sync + 'static {
    async fn deliver(&self, recipient: &str, subject: &str, body: &str)
        -> Result<(), TransportError>;

    /// Transport name for logging.
    fn name(&self) -> &str;
}
