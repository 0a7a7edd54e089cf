//! Broker client abstraction.
//!
//! This module contains:
//! - `Publisher` / `Broker` traits: queue declaration, publish, consume
//! - `Envelope` / `Delivery`: messages in flight and their ack handles
//! - Capability views (`PublishOnly`, `RequestReply`) over one broker handle
//! - Implementations: AMQP (RabbitMQ), in-memory

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::Serialize;

// Implementation modules
#[cfg(feature = "amqp")]
pub mod amqp;
pub mod memory;

// Re-exports
#[cfg(feature = "amqp")]
pub use amqp::{AmqpBroker, AmqpConnection};
pub use memory::{MemoryBroker, QueueStats};

/// Content type used for every JSON body this crate publishes.
pub const JSON_CONTENT_TYPE: &str = "application/json";

// ============================================================================
// Errors
// ============================================================================

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Errors that can occur during broker operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    #[error("Queue '{queue}' already exists with durable={}", !requested)]
    DurabilityConflict { queue: String, requested: bool },

    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("Resource locked: {0}")]
    ResourceLocked(String),

    #[error("Queue not found: {0}")]
    NotFound(String),

    #[error("Queue '{0}' is not empty")]
    NotEmpty(String),
}

impl BrokerError {
    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, BrokerError::Unavailable(_))
    }
}

// ============================================================================
// Messages
// ============================================================================

/// A message in flight.
///
/// Correlation id and reply address travel as message properties, never in
/// the body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Envelope {
    pub body: Bytes,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub content_type: Option<String>,
    /// Survive a broker restart (delivery mode 2).
    pub persistent: bool,
}

impl Envelope {
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            ..Default::default()
        }
    }

    /// JSON-encode `value` into a new envelope.
    pub fn json<T: Serialize + ?Sized>(value: &T) -> serde_json::Result<Self> {
        let body = serde_json::to_vec(value)?;
        Ok(Self {
            body: Bytes::from(body),
            content_type: Some(JSON_CONTENT_TYPE.to_string()),
            ..Default::default()
        })
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_reply_to(mut self, queue: impl Into<String>) -> Self {
        self.reply_to = Some(queue.into());
        self
    }

    pub fn persistent(mut self) -> Self {
        self.persistent = true;
        self
    }
}

/// Settles a single delivery on the channel that received it.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<()>;
    async fn nack(&self, requeue: bool) -> Result<()>;
}

/// Acknowledger for deliveries consumed with `auto_ack`.
pub struct AutoAcked;

#[async_trait]
impl Acknowledger for AutoAcked {
    async fn ack(&self) -> Result<()> {
        Ok(())
    }

    async fn nack(&self, _requeue: bool) -> Result<()> {
        Ok(())
    }
}

/// An envelope handed to a consumer, plus the handle to settle it.
pub struct Delivery {
    pub envelope: Envelope,
    pub delivery_tag: u64,
    pub redelivered: bool,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(
        envelope: Envelope,
        delivery_tag: u64,
        redelivered: bool,
        acker: Box<dyn Acknowledger>,
    ) -> Self {
        Self {
            envelope,
            delivery_tag,
            redelivered,
            acker,
        }
    }

    /// Acknowledge successful processing. Settling twice is a no-op.
    pub async fn ack(&self) -> Result<()> {
        self.acker.ack().await
    }

    /// Negatively acknowledge. With `requeue == false` the broker drops
    /// (or dead-letters) the message.
    pub async fn nack(&self, requeue: bool) -> Result<()> {
        self.acker.nack(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("envelope", &self.envelope)
            .field("delivery_tag", &self.delivery_tag)
            .field("redelivered", &self.redelivered)
            .finish_non_exhaustive()
    }
}

/// Stream of deliveries from one consumer. Ending means the channel is gone.
pub type Subscription = BoxStream<'static, Result<Delivery>>;

// ============================================================================
// Queues
// ============================================================================

/// Declaration parameters for a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    /// Empty name asks the broker to generate one.
    pub name: String,
    pub durable: bool,
    /// Private to the declaring connection.
    pub exclusive: bool,
    /// Removed once its last consumer goes away.
    pub auto_delete: bool,
}

impl QueueSpec {
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            exclusive: false,
            auto_delete: false,
        }
    }

    pub fn transient(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: false,
            exclusive: false,
            auto_delete: false,
        }
    }

    /// Server-named, exclusive, auto-delete queue for RPC replies.
    pub fn private_reply() -> Self {
        Self {
            name: String::new(),
            durable: false,
            exclusive: true,
            auto_delete: true,
        }
    }
}

/// Result of a successful declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueInfo {
    pub name: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

/// Consumer settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumeOptions {
    /// Max unacknowledged deliveries held by this consumer. 0 = unlimited.
    pub prefetch: u16,
    /// Deliveries are considered settled as soon as they are sent.
    pub auto_ack: bool,
}

impl Default for ConsumeOptions {
    fn default() -> Self {
        Self {
            prefetch: 1,
            auto_ack: false,
        }
    }
}

// ============================================================================
// Traits
// ============================================================================

/// Publish-side broker operations.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Declare a queue. Idempotent for identical parameters.
    async fn declare_queue(&self, spec: &QueueSpec) -> Result<QueueInfo>;

    /// Publish to `queue` through the default exchange.
    async fn publish(&self, queue: &str, envelope: Envelope) -> Result<()>;
}

/// Full broker handle: one logical channel.
///
/// Implementations:
/// - `AmqpBroker`: RabbitMQ via AMQP
/// - `MemoryBroker`: in-process, for tests and local runs
#[async_trait]
pub trait Broker: Publisher {
    /// Delete a queue, returning the number of messages it held.
    async fn delete_queue(&self, name: &str, if_empty: bool) -> Result<u32>;

    /// Start consuming `queue`.
    async fn consume(&self, queue: &str, options: ConsumeOptions) -> Result<Subscription>;
}

// ============================================================================
// Capability views
// ============================================================================

/// Fire-and-forget view: declare and publish only.
#[derive(Clone)]
pub struct PublishOnly {
    inner: Arc<dyn Broker>,
}

impl PublishOnly {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self { inner: broker }
    }
}

#[async_trait]
impl Publisher for PublishOnly {
    async fn declare_queue(&self, spec: &QueueSpec) -> Result<QueueInfo> {
        self.inner.declare_queue(spec).await
    }

    async fn publish(&self, queue: &str, envelope: Envelope) -> Result<()> {
        self.inner.publish(queue, envelope).await
    }
}

/// Request/reply view: the full broker handle used by RPC roles.
#[derive(Clone)]
pub struct RequestReply {
    inner: Arc<dyn Broker>,
}

impl RequestReply {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self { inner: broker }
    }
}

#[async_trait]
impl Publisher for RequestReply {
    async fn declare_queue(&self, spec: &QueueSpec) -> Result<QueueInfo> {
        self.inner.declare_queue(spec).await
    }

    async fn publish(&self, queue: &str, envelope: Envelope) -> Result<()> {
        self.inner.publish(queue, envelope).await
    }
}

#[async_trait]
impl Broker for RequestReply {
    async fn delete_queue(&self, name: &str, if_empty: bool) -> Result<u32> {
        self.inner.delete_queue(name, if_empty).await
    }

    async fn consume(&self, queue: &str, options: ConsumeOptions) -> Result<Subscription> {
        self.inner.consume(queue, options).await
    }
}
