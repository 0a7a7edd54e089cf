//! Notification producer.

use std::sync::Arc;

use backon::Retryable;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use super::{Notification, NotifyError};
use crate::broker::{Envelope, PublishOnly, Publisher};
use crate::provision::QueueProvisioner;
use crate::utils::retry::{is_retryable, publish_backoff};

/// Publishes notifications to a durable queue.
///
/// The queue is provisioned on first publish. Messages are persistent so
/// they survive a broker restart. Transient publish failures are retried
/// with bounded exponential backoff before surfacing.
pub struct NotificationPublisher {
    broker: PublishOnly,
    queue: String,
    provisioned: OnceCell<()>,
}

impl NotificationPublisher {
    pub fn new(broker: PublishOnly, queue: impl Into<String>) -> Self {
        Self {
            broker,
            queue: queue.into(),
            provisioned: OnceCell::new(),
        }
    }

    #[tracing::instrument(name = "notify.publish", skip_all, fields(queue = %self.queue))]
    pub async fn publish(&self, notification: &Notification) -> Result<(), NotifyError> {
        let envelope = Envelope::json(notification)?.persistent();

        (|| async {
            self.provision().await?;
            self.broker.publish(&self.queue, envelope.clone()).await?;
            Ok::<(), NotifyError>(())
        })
        .retry(publish_backoff())
        .when(|e: &NotifyError| matches!(e, NotifyError::Broker(err) if is_retryable(err)))
        .notify(|err, dur| {
            warn!(error = %err, retry_in = ?dur, "Notification publish failed, retrying");
        })
        .await?;

        debug!(recipient = %notification.recipient(), "Notification published");
        Ok(())
    }

    async fn provision(&self) -> Result<(), NotifyError> {
        self.provisioned
            .get_or_try_init(|| async {
                QueueProvisioner::new(Arc::new(self.broker.clone()))
                    .ensure(&self.queue, true)
                    .await
                    .map(|_| ())
            })
            .await?;
        Ok(())
    }
}
