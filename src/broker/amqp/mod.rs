//! AMQP (RabbitMQ) broker implementation.
//!
//! One `AmqpConnection` per process; each logical role (RPC client, RPC
//! worker, notification publisher, notification consumer) opens its own
//! channel through `AmqpConnection::open`. All traffic goes through the
//! default exchange with the queue name as routing key.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use lapin::{
    acker::Acker,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ConfirmSelectOptions, QueueDeclareOptions, QueueDeleteOptions,
    },
    protocol::{AMQPErrorKind, AMQPSoftError},
    types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use tracing::{debug, error, info};

use super::{
    Acknowledger, AutoAcked, Broker, BrokerError, ConsumeOptions, Delivery, Envelope, Publisher,
    QueueInfo, QueueSpec, Result, Subscription,
};
use crate::config::AmqpSettings;
use crate::utils::retry::retry_forever;

/// Delivery mode flag for messages that survive a broker restart.
const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// AMQP reply code for a normal close.
const REPLY_SUCCESS: u16 = 200;

/// Process-wide broker connection.
///
/// Created once on service start and closed on shutdown; components receive
/// per-role channels from it.
#[derive(Clone)]
pub struct AmqpConnection {
    connection: Arc<Connection>,
    url: String,
}

impl AmqpConnection {
    /// Connect, retrying forever at a fixed interval.
    ///
    /// This is the only place an unconditional retry happens.
    pub async fn connect(settings: &AmqpSettings) -> Self {
        let connection = retry_forever(settings.retry_delay(), &settings.url, || {
            Connection::connect(&settings.url, ConnectionProperties::default())
        })
        .await;

        connection.on_error(|err| {
            error!(error = %err, "AMQP connection lost");
        });
        info!(url = %settings.url, "Connected to AMQP");

        Self {
            connection: Arc::new(connection),
            url: settings.url.clone(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }

    /// Open a dedicated channel for one logical role.
    pub async fn open(&self, role: &str) -> Result<AmqpBroker> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| unavailable("Failed to create channel", e))?;

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| unavailable("Failed to enable publisher confirms", e))?;

        debug!(role = %role, channel = channel.id(), "Opened AMQP channel");

        Ok(AmqpBroker {
            connection: self.connection.clone(),
            channel,
            role: role.to_string(),
            consumer_seq: AtomicU64::new(0),
        })
    }

    /// Close the connection on shutdown.
    pub async fn close(&self) -> Result<()> {
        self.connection
            .close(REPLY_SUCCESS, "Normal shutdown")
            .await
            .map_err(|e| unavailable("Failed to close connection", e))?;
        info!(url = %self.url, "AMQP connection closed");
        Ok(())
    }
}

/// Broker handle bound to one AMQP channel.
pub struct AmqpBroker {
    connection: Arc<Connection>,
    channel: Channel,
    role: String,
    consumer_seq: AtomicU64,
}

impl AmqpBroker {
    /// Short-lived channel for declarations, so a 406 does not close the
    /// role channel.
    async fn admin_channel(&self) -> Result<Channel> {
        self.connection
            .create_channel()
            .await
            .map_err(|e| unavailable("Failed to create admin channel", e))
    }

    async fn release(channel: Channel) {
        if channel.status().connected() {
            let _ = channel.close(REPLY_SUCCESS, "OK").await;
        }
    }

    fn properties(envelope: &Envelope) -> BasicProperties {
        let mut properties = BasicProperties::default();
        if let Some(ref content_type) = envelope.content_type {
            properties = properties.with_content_type(content_type.as_str().into());
        }
        if let Some(ref correlation_id) = envelope.correlation_id {
            properties = properties.with_correlation_id(correlation_id.as_str().into());
        }
        if let Some(ref reply_to) = envelope.reply_to {
            properties = properties.with_reply_to(reply_to.as_str().into());
        }
        if envelope.persistent {
            properties = properties.with_delivery_mode(PERSISTENT_DELIVERY_MODE);
        }
        properties
    }

    fn envelope(delivery: &lapin::message::Delivery) -> Envelope {
        let props = &delivery.properties;
        Envelope {
            body: Bytes::copy_from_slice(&delivery.data),
            correlation_id: props.correlation_id().as_ref().map(|s| s.as_str().to_string()),
            reply_to: props.reply_to().as_ref().map(|s| s.as_str().to_string()),
            content_type: props.content_type().as_ref().map(|s| s.as_str().to_string()),
            persistent: *props.delivery_mode() == Some(PERSISTENT_DELIVERY_MODE),
        }
    }
}

#[async_trait]
impl Publisher for AmqpBroker {
    async fn declare_queue(&self, spec: &QueueSpec) -> Result<QueueInfo> {
        let channel = self.admin_channel().await?;

        let result = channel
            .queue_declare(
                &spec.name,
                QueueDeclareOptions {
                    durable: spec.durable,
                    exclusive: spec.exclusive,
                    auto_delete: spec.auto_delete,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await;

        Self::release(channel).await;

        let queue = result.map_err(|e| map_queue_error(&spec.name, Some(spec.durable), e))?;

        debug!(
            queue = %queue.name().as_str(),
            durable = spec.durable,
            exclusive = spec.exclusive,
            "Declared queue"
        );

        Ok(QueueInfo {
            name: queue.name().as_str().to_string(),
            message_count: queue.message_count(),
            consumer_count: queue.consumer_count(),
        })
    }

    async fn publish(&self, queue: &str, envelope: Envelope) -> Result<()> {
        let properties = Self::properties(&envelope);

        let confirm = self
            .channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                &envelope.body,
                properties,
            )
            .await
            .map_err(|e| unavailable("Failed to publish", e))?;

        let confirmation = confirm
            .await
            .map_err(|e| unavailable("Publish confirmation failed", e))?;

        if confirmation.is_nack() {
            return Err(BrokerError::Unavailable(format!(
                "Broker rejected publish to '{}'",
                queue
            )));
        }

        debug!(role = %self.role, queue = %queue, "Published message");
        Ok(())
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn delete_queue(&self, name: &str, if_empty: bool) -> Result<u32> {
        let channel = self.admin_channel().await?;

        let result = channel
            .queue_delete(
                name,
                QueueDeleteOptions {
                    if_empty,
                    ..Default::default()
                },
            )
            .await;

        Self::release(channel).await;

        result.map_err(|e| map_queue_error(name, None, e))
    }

    async fn consume(&self, queue: &str, options: ConsumeOptions) -> Result<Subscription> {
        self.channel
            .basic_qos(options.prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| unavailable("Failed to set prefetch", e))?;

        let tag = format!(
            "{}-{}",
            self.role,
            self.consumer_seq.fetch_add(1, Ordering::SeqCst)
        );

        let consumer = self
            .channel
            .basic_consume(
                queue,
                &tag,
                BasicConsumeOptions {
                    no_ack: options.auto_ack,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| map_queue_error(queue, None, e))?;

        info!(
            role = %self.role,
            queue = %queue,
            consumer_tag = %tag,
            prefetch = options.prefetch,
            "Consumer started"
        );

        let auto_ack = options.auto_ack;
        let stream = consumer.map(move |result| {
            result
                .map(|delivery| {
                    let envelope = AmqpBroker::envelope(&delivery);
                    let acker: Box<dyn Acknowledger> = if auto_ack {
                        Box::new(AutoAcked)
                    } else {
                        Box::new(AmqpAcker {
                            acker: delivery.acker,
                            settled: AtomicBool::new(false),
                        })
                    };
                    Delivery::new(envelope, delivery.delivery_tag, delivery.redelivered, acker)
                })
                .map_err(|e| unavailable("Consumer delivery error", e))
        });

        Ok(Box::pin(stream))
    }
}

/// Settles a delivery on the channel it arrived on.
struct AmqpAcker {
    acker: Acker,
    settled: AtomicBool,
}

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(&self) -> Result<()> {
        if self.settled.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| unavailable("Failed to ack", e))
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        if self.settled.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.acker
            .nack(BasicNackOptions {
                requeue,
                ..Default::default()
            })
            .await
            .map_err(|e| unavailable("Failed to nack", e))
    }
}

fn unavailable(context: &str, err: lapin::Error) -> BrokerError {
    BrokerError::Unavailable(format!("{}: {}", context, err))
}

/// Map a queue operation failure onto the broker error taxonomy.
fn map_queue_error(queue: &str, requested_durable: Option<bool>, err: lapin::Error) -> BrokerError {
    if let lapin::Error::ProtocolError(ref amqp) = err {
        let message = amqp.get_message().as_str().to_string();
        match amqp.kind() {
            AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED) => {
                return match requested_durable {
                    Some(requested) if message.contains("'durable'") => {
                        BrokerError::DurabilityConflict {
                            queue: queue.to_string(),
                            requested,
                        }
                    }
                    _ if message.contains("not empty") => BrokerError::NotEmpty(queue.to_string()),
                    _ => BrokerError::PreconditionFailed(message),
                };
            }
            AMQPErrorKind::Soft(AMQPSoftError::RESOURCELOCKED) => {
                return BrokerError::ResourceLocked(message);
            }
            AMQPErrorKind::Soft(AMQPSoftError::NOTFOUND) => {
                return BrokerError::NotFound(queue.to_string());
            }
            _ => {}
        }
    }
    BrokerError::Unavailable(format!("Queue operation on '{}' failed: {}", queue, err))
}
