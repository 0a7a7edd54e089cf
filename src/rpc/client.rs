//! Caller-side RPC client.
//!
//! Each client owns a private, exclusive, auto-delete reply queue and a
//! background task draining it. Outstanding calls wait in a table keyed by
//! correlation id; the background task hands each reply to its waiter.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{Result, RpcError};
use crate::broker::{
    Broker, BrokerError, ConsumeOptions, Envelope, Publisher, QueueSpec, RequestReply,
    Subscription,
};
use crate::config::RpcSettings;
use crate::provision::QueueProvisioner;

/// Bounds deadlines for timeouts too large to add to the current instant.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Deadline `timeout` from now, saturating at [`FAR_FUTURE`].
fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout).unwrap_or_else(|| now + FAR_FUTURE)
}

/// Client settings.
#[derive(Debug, Clone)]
pub struct RpcClientConfig {
    /// Well-known queue the worker consumes.
    pub request_queue: String,
    /// Must match the durability the worker declares.
    pub request_queue_durable: bool,
    /// Deadline used by `call`.
    pub default_timeout: Duration,
}

impl From<&RpcSettings> for RpcClientConfig {
    fn from(settings: &RpcSettings) -> Self {
        Self {
            request_queue: settings.request_queue.clone(),
            request_queue_durable: settings.durable,
            default_timeout: settings.timeout(),
        }
    }
}

// ============================================================================
// Pending calls
// ============================================================================

#[derive(Default)]
struct PendingState {
    waiters: HashMap<String, oneshot::Sender<Envelope>>,
    closed: bool,
}

/// Correlation id → waiting caller.
#[derive(Default)]
pub(crate) struct PendingCalls {
    state: Mutex<PendingState>,
}

impl PendingCalls {
    fn lock(&self) -> MutexGuard<'_, PendingState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a waiter. At most one per correlation id.
    pub(crate) fn register(&self, correlation_id: &str) -> Result<oneshot::Receiver<Envelope>> {
        let mut state = self.lock();
        if state.closed {
            return Err(RpcError::Broker(BrokerError::Unavailable(
                "reply consumer stopped".to_string(),
            )));
        }
        if state.waiters.contains_key(correlation_id) {
            return Err(RpcError::DuplicateCorrelationId(correlation_id.to_string()));
        }
        let (tx, rx) = oneshot::channel();
        state.waiters.insert(correlation_id.to_string(), tx);
        Ok(rx)
    }

    /// Hand a reply to its waiter. Returns false if nobody is waiting.
    pub(crate) fn fulfill(&self, correlation_id: &str, reply: Envelope) -> bool {
        let waiter = self.lock().waiters.remove(correlation_id);
        match waiter {
            Some(tx) => tx.send(reply).is_ok(),
            None => false,
        }
    }

    pub(crate) fn remove(&self, correlation_id: &str) {
        self.lock().waiters.remove(correlation_id);
    }

    /// Refuse new calls and fail every waiting one. Returns how many failed.
    pub(crate) fn close(&self) -> usize {
        let mut state = self.lock();
        state.closed = true;
        let failed = state.waiters.len();
        state.waiters.clear();
        failed
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().waiters.len()
    }
}

/// Removes the pending entry however the call ends: reply, timeout, error,
/// or the caller's future being dropped.
struct PendingGuard<'a> {
    pending: &'a PendingCalls,
    correlation_id: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.correlation_id);
    }
}

// ============================================================================
// Client
// ============================================================================

/// Synchronous-looking RPC over the broker.
///
/// Safe to share between tasks; concurrent calls are matched to their replies
/// independently.
pub struct RpcClient {
    broker: RequestReply,
    config: RpcClientConfig,
    reply_queue: String,
    pending: Arc<PendingCalls>,
    consumer: JoinHandle<()>,
}

impl RpcClient {
    /// Provision the request queue and a private reply queue, and start
    /// draining replies in the background.
    pub async fn start(broker: RequestReply, config: RpcClientConfig) -> Result<Self> {
        QueueProvisioner::new(Arc::new(broker.clone()))
            .ensure(&config.request_queue, config.request_queue_durable)
            .await?;

        let reply = broker.declare_queue(&QueueSpec::private_reply()).await?;
        let subscription = broker
            .consume(
                &reply.name,
                ConsumeOptions {
                    prefetch: 0,
                    auto_ack: true,
                },
            )
            .await?;

        let pending = Arc::new(PendingCalls::default());
        let consumer = tokio::spawn(Self::dispatch_replies(
            subscription,
            pending.clone(),
            reply.name.clone(),
        ));

        info!(
            request_queue = %config.request_queue,
            reply_queue = %reply.name,
            "RPC client started"
        );

        Ok(Self {
            broker,
            config,
            reply_queue: reply.name,
            pending,
            consumer,
        })
    }

    /// Name of the private reply queue.
    pub fn reply_queue(&self) -> &str {
        &self.reply_queue
    }

    /// Number of calls waiting for a reply.
    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }

    /// Call with the configured default timeout.
    pub async fn call<Req, Resp>(&self, request: &Req) -> Result<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        self.call_with_timeout(request, self.config.default_timeout)
            .await
    }

    /// JSON-encode `request`, call, and decode the reply.
    pub async fn call_with_timeout<Req, Resp>(
        &self,
        request: &Req,
        timeout: Duration,
    ) -> Result<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let envelope = Envelope::json(request).map_err(RpcError::Encode)?;
        let reply = self.call_envelope(envelope, timeout).await?;
        serde_json::from_slice(&reply.body).map_err(RpcError::Decode)
    }

    /// Call with an opaque body, returning the reply body.
    pub async fn call_raw(&self, body: Bytes, timeout: Duration) -> Result<Bytes> {
        let reply = self.call_envelope(Envelope::new(body), timeout).await?;
        Ok(reply.body)
    }

    /// Publish `envelope` as a request and wait until the matching reply
    /// arrives or `timeout` elapses. Publishing counts against the deadline.
    #[tracing::instrument(name = "rpc.call", skip_all, fields(queue = %self.config.request_queue))]
    pub async fn call_envelope(&self, envelope: Envelope, timeout: Duration) -> Result<Envelope> {
        let deadline = deadline_after(timeout);
        let correlation_id = Uuid::new_v4().to_string();

        let receiver = self.pending.register(&correlation_id)?;
        let _guard = PendingGuard {
            pending: &self.pending,
            correlation_id: correlation_id.clone(),
        };

        let request = envelope
            .with_correlation_id(correlation_id.as_str())
            .with_reply_to(self.reply_queue.as_str());

        match tokio::time::timeout_at(
            deadline,
            self.broker.publish(&self.config.request_queue, request),
        )
        .await
        {
            Ok(published) => published?,
            Err(_) => {
                warn!(correlation_id = %correlation_id, "Timed out publishing request");
                return Err(RpcError::Timeout(timeout));
            }
        }

        debug!(correlation_id = %correlation_id, "Request published, awaiting reply");

        match tokio::time::timeout_at(deadline, receiver).await {
            Ok(Ok(reply)) => {
                debug!(correlation_id = %correlation_id, "Reply received");
                Ok(reply)
            }
            Ok(Err(_)) => Err(RpcError::Broker(BrokerError::Unavailable(
                "reply consumer stopped".to_string(),
            ))),
            Err(_) => {
                warn!(correlation_id = %correlation_id, timeout = ?timeout, "RPC call timed out");
                Err(RpcError::Timeout(timeout))
            }
        }
    }

    async fn dispatch_replies(
        mut subscription: Subscription,
        pending: Arc<PendingCalls>,
        reply_queue: String,
    ) {
        while let Some(item) = subscription.next().await {
            match item {
                Ok(delivery) => {
                    let Some(correlation_id) = delivery.envelope.correlation_id.clone() else {
                        warn!(
                            reply_queue = %reply_queue,
                            "Discarding reply without correlation id"
                        );
                        continue;
                    };
                    if !pending.fulfill(&correlation_id, delivery.envelope) {
                        debug!(
                            correlation_id = %correlation_id,
                            "Discarding reply with no pending call"
                        );
                    }
                }
                Err(e) => {
                    error!(error = %e, reply_queue = %reply_queue, "Reply consumer failed");
                    break;
                }
            }
        }

        let failed = pending.close();
        warn!(reply_queue = %reply_queue, failed, "Reply consumer stopped");
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.consumer.abort();
    }
}
