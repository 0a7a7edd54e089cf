//! Request/reply over the broker.
//!
//! - `RpcClient`: caller-side facade; publishes a request tagged with a fresh
//!   correlation id and waits for the matching reply on a private queue.
//! - `RpcWorker`: consumes the well-known request queue, runs a
//!   `RequestHandler`, and replies to the request's `reply_to` address.

use std::time::Duration;

use http::StatusCode;

use crate::broker::BrokerError;

pub mod client;
pub mod server;

pub use client::{RpcClient, RpcClientConfig};
pub use server::{HandlerError, RequestHandler, RpcWorker, RpcWorkerConfig};

/// Result type for RPC calls.
pub type Result<T> = std::result::Result<T, RpcError>;

/// Errors surfaced to an RPC caller.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("No reply within {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("Failed to encode request: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("Failed to decode reply: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("Correlation id already pending: {0}")]
    DuplicateCorrelationId(String),
}

impl RpcError {
    /// HTTP status a gateway should answer with.
    pub fn http_status(&self) -> StatusCode {
        match self {
            RpcError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            RpcError::Broker(_) => StatusCode::SERVICE_UNAVAILABLE,
            RpcError::Decode(_) => StatusCode::BAD_GATEWAY,
            RpcError::Encode(_) | RpcError::DuplicateCorrelationId(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

#[cfg(test)]
mod tests;
