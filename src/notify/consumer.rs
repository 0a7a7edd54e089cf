//! Notification consumer.
//!
//! Acks after the transport succeeds. A transport failure is assumed to be
//! transient (relay timeout, SMTP hiccup) and the message is requeued. A
//! body that does not decode will never succeed and is dropped.

use std::sync::Arc;
use std::time::Duration;

use futures::TryStreamExt;
use tokio::sync::watch;
use tracing::{debug, info, warn, Instrument};

use super::{MailTransport, Notification};
use crate::broker::{Broker, BrokerError, ConsumeOptions, Delivery, PublishOnly};
use crate::config::NotificationSettings;
use crate::provision::QueueProvisioner;
use crate::utils::bootstrap::wait_for_shutdown;

/// Consumer settings.
#[derive(Debug, Clone)]
pub struct NotificationConsumerConfig {
    pub queue: String,
    /// Zero is raised to one.
    pub prefetch: u16,
    /// Pause before requeueing a failed delivery.
    pub requeue_delay: Duration,
}

impl From<&NotificationSettings> for NotificationConsumerConfig {
    fn from(settings: &NotificationSettings) -> Self {
        Self {
            queue: settings.queue.clone(),
            prefetch: settings.prefetch,
            requeue_delay: settings.requeue_delay(),
        }
    }
}

/// Long-running consumer of the notification queue.
pub struct NotificationConsumer {
    broker: Arc<dyn Broker>,
    transport: Arc<dyn MailTransport>,
    config: NotificationConsumerConfig,
}

impl NotificationConsumer {
    pub fn new(
        broker: Arc<dyn Broker>,
        transport: Arc<dyn MailTransport>,
        config: NotificationConsumerConfig,
    ) -> Self {
        Self {
            broker,
            transport,
            config,
        }
    }

    /// Deliver notifications until shutdown is signalled.
    ///
    /// Returns `Unavailable` if the subscription ends.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), BrokerError> {
        QueueProvisioner::new(Arc::new(PublishOnly::new(self.broker.clone())))
            .ensure(&self.config.queue, true)
            .await?;

        let prefetch = self.config.prefetch.max(1);
        let subscription = self
            .broker
            .consume(
                &self.config.queue,
                ConsumeOptions {
                    prefetch,
                    auto_ack: false,
                },
            )
            .await?;

        info!(
            queue = %self.config.queue,
            transport = self.transport.name(),
            "Waiting for notifications"
        );

        let concurrency = usize::from(prefetch);
        let processing =
            subscription.try_for_each_concurrent(concurrency, |delivery| self.process(delivery));

        tokio::select! {
            result = processing => {
                result?;
                Err(BrokerError::Unavailable(format!(
                    "notification consumer on '{}' stopped",
                    self.config.queue
                )))
            }
            _ = wait_for_shutdown(&mut shutdown) => {
                info!(queue = %self.config.queue, "Notification consumer shutting down");
                Ok(())
            }
        }
    }

    async fn process(&self, delivery: Delivery) -> Result<(), BrokerError> {
        let span = tracing::info_span!(
            "notify.deliver",
            delivery_tag = delivery.delivery_tag,
            redelivered = delivery.redelivered
        );

        async {
            let notification: Notification =
                match serde_json::from_slice(&delivery.envelope.body) {
                    Ok(notification) => notification,
                    Err(e) => {
                        warn!(error = %e, "Failed to decode notification, dropping");
                        return delivery.nack(false).await;
                    }
                };

            match self
                .transport
                .deliver(
                    notification.recipient(),
                    &notification.subject,
                    &notification.body,
                )
                .await
            {
                Ok(()) => {
                    delivery.ack().await?;
                    debug!(recipient = %notification.recipient(), "Notification acknowledged");
                    Ok(())
                }
                Err(e) => {
                    warn!(
                        error = %e,
                        transient = e.is_transient(),
                        recipient = %notification.recipient(),
                        "Delivery failed, requeueing"
                    );
                    if !self.config.requeue_delay.is_zero() {
                        tokio::time::sleep(self.config.requeue_delay).await;
                    }
                    delivery.nack(true).await
                }
            }
        }
        .instrument(span)
        .await
    }
}
