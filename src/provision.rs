//! Queue provisioning.
//!
//! Producers and consumers call `ensure` before first use. Declaration is
//! idempotent; a queue that already exists with a different durability is
//! never silently replaced.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::broker::{Broker, BrokerError, Publisher, QueueSpec, RequestReply, Result};

/// A provisioned queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Queue {
    pub name: String,
    pub durable: bool,
    pub message_count: u32,
    pub consumer_count: u32,
}

/// Ensures queues exist with the required durability.
#[derive(Clone)]
pub struct QueueProvisioner {
    declarer: Arc<dyn Publisher>,
    /// Present only when recreation was explicitly authorized.
    deleter: Option<Arc<dyn Broker>>,
}

impl QueueProvisioner {
    /// Provisioner that fails on durability conflicts.
    pub fn new(declarer: Arc<dyn Publisher>) -> Self {
        Self {
            declarer,
            deleter: None,
        }
    }

    /// Provisioner allowed to recreate empty queues on durability conflicts.
    /// A queue still holding messages yields `DurabilityConflict`.
    pub fn recreating_if_empty(broker: Arc<dyn Broker>) -> Self {
        Self {
            declarer: Arc::new(RequestReply::new(broker.clone())),
            deleter: Some(broker),
        }
    }

    /// Ensure `name` exists with the given durability.
    ///
    /// Safe to call concurrently and repeatedly for the same name.
    pub async fn ensure(&self, name: &str, durable: bool) -> Result<Queue> {
        let spec = QueueSpec {
            name: name.to_string(),
            durable,
            exclusive: false,
            auto_delete: false,
        };

        match self.declarer.declare_queue(&spec).await {
            Ok(info) => {
                debug!(queue = %info.name, durable, "Queue ensured");
                Ok(Queue {
                    name: info.name,
                    durable,
                    message_count: info.message_count,
                    consumer_count: info.consumer_count,
                })
            }
            Err(conflict @ BrokerError::DurabilityConflict { .. }) => match self.deleter {
                None => {
                    warn!(queue = %name, requested_durable = durable, "Queue durability conflict");
                    Err(conflict)
                }
                Some(ref broker) => Self::recreate(broker.as_ref(), &spec, conflict).await,
            },
            Err(e) => Err(e),
        }
    }

    async fn recreate(
        broker: &dyn Broker,
        spec: &QueueSpec,
        conflict: BrokerError,
    ) -> Result<Queue> {
        match broker.delete_queue(&spec.name, true).await {
            Ok(_) => {}
            Err(BrokerError::NotEmpty(_)) => {
                warn!(
                    queue = %spec.name,
                    "Refusing to recreate non-empty queue with different durability"
                );
                return Err(conflict);
            }
            Err(e) => return Err(e),
        }

        let info = broker.declare_queue(spec).await?;
        info!(
            queue = %info.name,
            durable = spec.durable,
            "Recreated empty queue with new durability"
        );

        Ok(Queue {
            name: info.name,
            durable: spec.durable,
            message_count: info.message_count,
            consumer_count: info.consumer_count,
        })
    }
}
