//! Broker, RPC and notification configuration types.

use std::time::Duration;

use serde::Deserialize;

/// Default request queue served by the OCR worker.
pub const DEFAULT_REQUEST_QUEUE: &str = "ocr_service";
/// Default durable queue for email notifications.
pub const DEFAULT_NOTIFICATION_QUEUE: &str = "email_notification";

/// AMQP connection configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AmqpSettings {
    /// AMQP connection URL.
    pub url: String,
    /// Fixed delay between connection attempts.
    pub retry_delay_secs: u64,
}

impl AmqpSettings {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }
}

impl Default for AmqpSettings {
    fn default() -> Self {
        Self {
            url: "amqp://localhost:5672".to_string(),
            retry_delay_secs: 5,
        }
    }
}

/// Request/reply configuration, shared by caller and worker.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RpcSettings {
    /// Well-known queue the worker consumes.
    pub request_queue: String,
    /// Durability of the request queue. Must match across all services.
    pub durable: bool,
    /// Caller-side deadline for a reply.
    pub timeout_secs: u64,
    /// Max requests a worker holds unacknowledged.
    pub prefetch: u16,
}

impl RpcSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for RpcSettings {
    fn default() -> Self {
        Self {
            request_queue: DEFAULT_REQUEST_QUEUE.to_string(),
            durable: false,
            timeout_secs: 30,
            prefetch: 1,
        }
    }
}

/// Notification queue configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotificationSettings {
    /// Durable queue name.
    pub queue: String,
    /// Max notifications a consumer holds unacknowledged.
    pub prefetch: u16,
    /// Pause before requeueing a notification whose delivery failed.
    pub requeue_delay_ms: u64,
    /// Mail transport used by the consumer.
    pub transport: TransportSettings,
}

impl NotificationSettings {
    pub fn requeue_delay(&self) -> Duration {
        Duration::from_millis(self.requeue_delay_ms)
    }
}

impl Default for NotificationSettings {
    fn default() -> Self {
        Self {
            queue: DEFAULT_NOTIFICATION_QUEUE.to_string(),
            prefetch: 1,
            requeue_delay_ms: 1000,
            transport: TransportSettings::default(),
        }
    }
}

/// Mail transport discriminator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportType {
    /// Log notifications instead of sending them.
    #[default]
    Log,
    /// POST notifications to a mail relay.
    Webhook,
}

/// Mail transport configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    #[serde(rename = "type")]
    pub transport_type: TransportType,
    /// Relay endpoint (webhook only).
    pub url: Option<String>,
    pub timeout_secs: u64,
}

impl TransportSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            transport_type: TransportType::Log,
            url: None,
            timeout_secs: 10,
        }
    }
}
