//! In-memory broker for tests and local runs.
//!
//! Implements the queue contract of RabbitMQ's default exchange within a
//! single process: durable/exclusive/auto-delete queues, per-consumer
//! prefetch, and ack/nack with requeue. Every `MemoryBroker` handle acts as
//! one connection; `connection()` opens another on the same broker.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::{debug, info};

use super::{
    Acknowledger, AutoAcked, Broker, BrokerError, ConsumeOptions, Delivery, Envelope, Publisher,
    QueueInfo, QueueSpec, Result, Subscription,
};

/// Prefix for server-generated queue names.
const GENERATED_QUEUE_PREFIX: &str = "amq.gen-";

/// Counters for one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Messages waiting for a consumer.
    pub ready: usize,
    /// Delivered but not yet settled.
    pub unacked: usize,
    pub acked: u64,
    /// Rejected without requeue.
    pub dropped: u64,
    /// Total deliveries, redeliveries included.
    pub delivered: u64,
    pub redelivered: u64,
}

#[derive(Clone)]
struct Stored {
    envelope: Envelope,
    redelivered: bool,
}

struct QueueState {
    generation: u64,
    durable: bool,
    exclusive: bool,
    auto_delete: bool,
    owner: Option<u64>,
    ready: VecDeque<Stored>,
    consumers: usize,
    stats: QueueStats,
}

impl QueueState {
    fn info(&self, name: &str) -> QueueInfo {
        QueueInfo {
            name: name.to_string(),
            message_count: self.ready.len() as u32,
            consumer_count: self.consumers as u32,
        }
    }

    fn locked_for(&self, connection_id: u64) -> bool {
        self.exclusive && self.owner != Some(connection_id)
    }
}

#[derive(Default)]
struct HubState {
    queues: HashMap<String, QueueState>,
    closed: bool,
    next_generation: u64,
}

#[derive(Default)]
struct Hub {
    state: Mutex<HubState>,
    notify: Notify,
    next_connection: AtomicU64,
    next_tag: AtomicU64,
}

impl Hub {
    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wake(&self) {
        self.notify.notify_waiters();
    }
}

/// In-process broker handle (one connection).
pub struct MemoryBroker {
    hub: Arc<Hub>,
    connection_id: u64,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    /// Create a new, empty broker and a first connection to it.
    pub fn new() -> Self {
        let hub = Arc::new(Hub::default());
        let connection_id = hub.next_connection.fetch_add(1, Ordering::SeqCst);
        info!("Memory broker initialized");
        Self { hub, connection_id }
    }

    /// Open another connection to the same broker.
    pub fn connection(&self) -> Self {
        let connection_id = self.hub.next_connection.fetch_add(1, Ordering::SeqCst);
        Self {
            hub: self.hub.clone(),
            connection_id,
        }
    }

    pub fn queue_exists(&self, name: &str) -> bool {
        self.hub.lock().queues.contains_key(name)
    }

    pub fn queue_stats(&self, name: &str) -> Option<QueueStats> {
        let state = self.hub.lock();
        state.queues.get(name).map(|q| QueueStats {
            ready: q.ready.len(),
            ..q.stats
        })
    }

    /// Names of all declared queues, sorted.
    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.hub.lock().queues.keys().cloned().collect();
        names.sort();
        names
    }

    /// Simulate broker loss: every subscription ends and every operation
    /// fails with `Unavailable` from now on.
    pub fn close_all(&self) {
        self.hub.lock().closed = true;
        self.hub.wake();
        info!("Memory broker closed");
    }

    fn check_open(state: &HubState) -> Result<()> {
        if state.closed {
            return Err(BrokerError::Unavailable("memory broker closed".to_string()));
        }
        Ok(())
    }
}

impl Drop for MemoryBroker {
    fn drop(&mut self) {
        let id = self.connection_id;
        let mut state = self.hub.lock();
        let before = state.queues.len();
        state
            .queues
            .retain(|_, q| !(q.exclusive && q.owner == Some(id)));
        let removed = before - state.queues.len();
        drop(state);
        if removed > 0 {
            debug!(connection = id, removed, "Removed exclusive queues on close");
            self.hub.wake();
        }
    }
}

#[async_trait]
impl Publisher for MemoryBroker {
    async fn declare_queue(&self, spec: &QueueSpec) -> Result<QueueInfo> {
        let mut state = self.hub.lock();
        Self::check_open(&state)?;

        let name = if spec.name.is_empty() {
            format!("{}{}", GENERATED_QUEUE_PREFIX, uuid::Uuid::new_v4().simple())
        } else {
            spec.name.clone()
        };

        if let Some(existing) = state.queues.get(&name) {
            if existing.locked_for(self.connection_id) {
                return Err(BrokerError::ResourceLocked(format!(
                    "queue '{}' is exclusive to another connection",
                    name
                )));
            }
            if existing.durable != spec.durable {
                return Err(BrokerError::DurabilityConflict {
                    queue: name,
                    requested: spec.durable,
                });
            }
            if existing.exclusive != spec.exclusive || existing.auto_delete != spec.auto_delete {
                return Err(BrokerError::PreconditionFailed(format!(
                    "inequivalent arg for queue '{}'",
                    name
                )));
            }
            return Ok(existing.info(&name));
        }

        let generation = state.next_generation;
        state.next_generation += 1;
        let queue = QueueState {
            generation,
            durable: spec.durable,
            exclusive: spec.exclusive,
            auto_delete: spec.auto_delete,
            owner: spec.exclusive.then_some(self.connection_id),
            ready: VecDeque::new(),
            consumers: 0,
            stats: QueueStats::default(),
        };
        let info = queue.info(&name);
        state.queues.insert(name.clone(), queue);

        debug!(queue = %name, durable = spec.durable, exclusive = spec.exclusive, "Declared queue");
        Ok(info)
    }

    async fn publish(&self, queue: &str, envelope: Envelope) -> Result<()> {
        let mut state = self.hub.lock();
        Self::check_open(&state)?;

        match state.queues.get_mut(queue) {
            Some(q) => {
                q.ready.push_back(Stored {
                    envelope,
                    redelivered: false,
                });
            }
            None => {
                debug!(queue = %queue, "Unroutable message dropped");
                return Ok(());
            }
        }
        drop(state);

        self.hub.wake();
        Ok(())
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn delete_queue(&self, name: &str, if_empty: bool) -> Result<u32> {
        let mut state = self.hub.lock();
        Self::check_open(&state)?;

        let Some(queue) = state.queues.get(name) else {
            return Ok(0);
        };
        if queue.locked_for(self.connection_id) {
            return Err(BrokerError::ResourceLocked(format!(
                "queue '{}' is exclusive to another connection",
                name
            )));
        }
        if if_empty && (!queue.ready.is_empty() || queue.stats.unacked > 0) {
            return Err(BrokerError::NotEmpty(name.to_string()));
        }

        let removed = state
            .queues
            .remove(name)
            .map(|q| q.ready.len() as u32)
            .unwrap_or(0);
        drop(state);

        self.hub.wake();
        debug!(queue = %name, messages = removed, "Deleted queue");
        Ok(removed)
    }

    async fn consume(&self, queue: &str, options: ConsumeOptions) -> Result<Subscription> {
        let generation = {
            let mut state = self.hub.lock();
            Self::check_open(&state)?;
            let q = state
                .queues
                .get_mut(queue)
                .ok_or_else(|| BrokerError::NotFound(queue.to_string()))?;
            if q.locked_for(self.connection_id) {
                return Err(BrokerError::ResourceLocked(format!(
                    "queue '{}' is exclusive to another connection",
                    queue
                )));
            }
            q.consumers += 1;
            q.generation
        };

        let consumer = ConsumerState {
            hub: self.hub.clone(),
            queue: queue.to_string(),
            generation,
            options,
            in_flight: Arc::new(AtomicUsize::new(0)),
        };

        debug!(queue = %queue, prefetch = options.prefetch, "Consumer started");

        let stream = futures::stream::unfold(consumer, |consumer| async move {
            loop {
                let hub = consumer.hub.clone();
                let notified = hub.notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                match consumer.poll_next() {
                    Next::Delivery(delivery) => return Some((Ok(delivery), consumer)),
                    Next::End => return None,
                    Next::Wait => notified.await,
                }
            }
        });

        Ok(Box::pin(stream))
    }
}

// ============================================================================
// Consumer
// ============================================================================

enum Next {
    Delivery(Delivery),
    Wait,
    End,
}

struct ConsumerState {
    hub: Arc<Hub>,
    queue: String,
    generation: u64,
    options: ConsumeOptions,
    in_flight: Arc<AtomicUsize>,
}

impl ConsumerState {
    fn poll_next(&self) -> Next {
        let mut state = self.hub.lock();
        if state.closed {
            return Next::End;
        }
        let Some(q) = state.queues.get_mut(&self.queue) else {
            return Next::End;
        };
        if q.generation != self.generation {
            return Next::End;
        }

        let limit = self.options.prefetch as usize;
        if !self.options.auto_ack && limit > 0 && self.in_flight.load(Ordering::SeqCst) >= limit {
            return Next::Wait;
        }

        let Some(stored) = q.ready.pop_front() else {
            return Next::Wait;
        };

        q.stats.delivered += 1;
        if stored.redelivered {
            q.stats.redelivered += 1;
        }

        let tag = self.hub.next_tag.fetch_add(1, Ordering::SeqCst) + 1;
        let envelope = stored.envelope.clone();
        let redelivered = stored.redelivered;

        let acker: Box<dyn Acknowledger> = if self.options.auto_ack {
            q.stats.acked += 1;
            Box::new(AutoAcked)
        } else {
            q.stats.unacked += 1;
            self.in_flight.fetch_add(1, Ordering::SeqCst);
            Box::new(MemoryAcker {
                hub: self.hub.clone(),
                queue: self.queue.clone(),
                generation: self.generation,
                stored,
                in_flight: self.in_flight.clone(),
                settled: AtomicBool::new(false),
            })
        };

        Next::Delivery(Delivery::new(envelope, tag, redelivered, acker))
    }
}

impl Drop for ConsumerState {
    fn drop(&mut self) {
        let mut state = self.hub.lock();
        let remove = match state.queues.get_mut(&self.queue) {
            Some(q) if q.generation == self.generation => {
                q.consumers = q.consumers.saturating_sub(1);
                q.auto_delete && q.consumers == 0
            }
            _ => false,
        };
        if remove {
            state.queues.remove(&self.queue);
            debug!(queue = %self.queue, "Auto-deleted queue after last consumer");
        }
        drop(state);
        self.hub.wake();
    }
}

// ============================================================================
// Acknowledgement
// ============================================================================

#[derive(Clone, Copy)]
enum Outcome {
    Ack,
    Nack { requeue: bool },
}

struct MemoryAcker {
    hub: Arc<Hub>,
    queue: String,
    generation: u64,
    stored: Stored,
    in_flight: Arc<AtomicUsize>,
    settled: AtomicBool,
}

impl MemoryAcker {
    fn settle(&self, outcome: Outcome) -> Result<()> {
        let mut state = self.hub.lock();
        MemoryBroker::check_open(&state)?;
        if self.settled.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if let Some(q) = state.queues.get_mut(&self.queue) {
            if q.generation == self.generation {
                q.stats.unacked = q.stats.unacked.saturating_sub(1);
                match outcome {
                    Outcome::Ack => q.stats.acked += 1,
                    Outcome::Nack { requeue: true } => q.ready.push_front(Stored {
                        envelope: self.stored.envelope.clone(),
                        redelivered: true,
                    }),
                    Outcome::Nack { requeue: false } => q.stats.dropped += 1,
                }
            }
        }
        drop(state);

        self.hub.wake();
        Ok(())
    }
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        self.settle(Outcome::Ack)
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.settle(Outcome::Nack { requeue })
    }
}

impl Drop for MemoryAcker {
    fn drop(&mut self) {
        // Unsettled deliveries go back to the queue, as on channel close.
        if !self.settled.load(Ordering::SeqCst) {
            let _ = self.settle(Outcome::Nack { requeue: true });
        }
    }
}
