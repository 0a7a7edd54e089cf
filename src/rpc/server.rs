//! RPC worker.
//!
//! Consumes the well-known request queue with a fixed prefetch. For each
//! delivery: decode, run the handler, publish the reply to `reply_to` with
//! the same correlation id, then ack. Failures that retrying cannot fix
//! (bad envelope, undecodable body, handler error) are nacked without
//! requeue so a poison message is delivered at most once more than never.

use std::sync::Arc;

use async_trait::async_trait;
use futures::TryStreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn, Instrument};

use crate::broker::{
    Broker, BrokerError, ConsumeOptions, Delivery, Envelope, Publisher, RequestReply,
};
use crate::config::RpcSettings;
use crate::provision::QueueProvisioner;
use crate::utils::bootstrap::wait_for_shutdown;

/// Errors a request handler may return.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Processing failed: {0}")]
    Processing(String),
}

/// Processing callback invoked by the worker.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    type Request: DeserializeOwned + Send + 'static;
    type Response: Serialize + Send + 'static;

    async fn handle(&self, request: Self::Request) -> Result<Self::Response, HandlerError>;
}

/// Worker settings.
#[derive(Debug, Clone)]
pub struct RpcWorkerConfig {
    pub queue: String,
    pub durable: bool,
    /// Max requests in flight for this worker instance. Zero is raised to
    /// one, since AMQP reads a zero prefetch as unlimited.
    pub prefetch: u16,
}

impl From<&RpcSettings> for RpcWorkerConfig {
    fn from(settings: &RpcSettings) -> Self {
        Self {
            queue: settings.request_queue.clone(),
            durable: settings.durable,
            prefetch: settings.prefetch,
        }
    }
}

/// Long-running consumer of the request queue.
pub struct RpcWorker<H> {
    broker: RequestReply,
    handler: Arc<H>,
    config: RpcWorkerConfig,
}

impl<H: RequestHandler> RpcWorker<H> {
    pub fn new(broker: RequestReply, handler: H, config: RpcWorkerConfig) -> Self {
        Self {
            broker,
            handler: Arc::new(handler),
            config,
        }
    }

    /// Process requests until shutdown is signalled.
    ///
    /// Returns `Ok(())` on shutdown. Returns `Unavailable` when the request
    /// stream ends or a reply cannot be published; the caller reconnects.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), BrokerError> {
        QueueProvisioner::new(Arc::new(self.broker.clone()))
            .ensure(&self.config.queue, self.config.durable)
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

        let concurrency = usize::from(prefetch);
        info!(
            queue = %self.config.queue,
            prefetch,
            "Awaiting RPC requests"
        );

        let processing =
            subscription.try_for_each_concurrent(concurrency, |delivery| self.process(delivery));

        tokio::select! {
            result = processing => {
                result?;
                Err(BrokerError::Unavailable(format!(
                    "request consumer on '{}' stopped",
                    self.config.queue
                )))
            }
            _ = wait_for_shutdown(&mut shutdown) => {
                info!(queue = %self.config.queue, "RPC worker shutting down");
                Ok(())
            }
        }
    }

    async fn process(&self, delivery: Delivery) -> Result<(), BrokerError> {
        let span = tracing::info_span!(
            "rpc.process",
            delivery_tag = delivery.delivery_tag,
            correlation_id = delivery.envelope.correlation_id.as_deref().unwrap_or("")
        );

        async {
            let Some(reply_to) = delivery.envelope.reply_to.clone() else {
                warn!("Request has no reply_to, rejecting");
                return delivery.nack(false).await;
            };

            let request: H::Request = match serde_json::from_slice(&delivery.envelope.body) {
                Ok(request) => request,
                Err(e) => {
                    warn!(error = %e, "Failed to decode request, rejecting");
                    return delivery.nack(false).await;
                }
            };

            let response = match self.handler.handle(request).await {
                Ok(response) => response,
                Err(e) => {
                    error!(
                        error = %e,
                        redelivered = delivery.redelivered,
                        "Handler failed, rejecting"
                    );
                    return delivery.nack(false).await;
                }
            };

            let mut reply = match Envelope::json(&response) {
                Ok(reply) => reply,
                Err(e) => {
                    error!(error = %e, "Failed to encode response, rejecting");
                    return delivery.nack(false).await;
                }
            };
            if let Some(ref correlation_id) = delivery.envelope.correlation_id {
                reply = reply.with_correlation_id(correlation_id.as_str());
            }

            if let Err(e) = self.broker.publish(&reply_to, reply).await {
                error!(error = %e, reply_to = %reply_to, "Failed to publish reply, requeueing");
                let _ = delivery.nack(true).await;
                return Err(e);
            }

            delivery.ack().await?;
            debug!(reply_to = %reply_to, "Replied");
            Ok(())
        }
        .instrument(span)
        .await
    }
}
