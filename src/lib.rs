//! rpcbus - RPC and notifications over a message broker
//!
//! Request/reply calls with correlation ids and private reply queues,
//! prefetch-bounded workers, and durable fire-and-forget notifications.
//! Backed by RabbitMQ (AMQP 0-9-1) or an in-memory broker.

pub mod broker;
pub mod config;
pub mod notify;
pub mod ocr;
pub mod provision;
pub mod rpc;
pub mod utils;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
