//! Retry utilities: backoff builders and retryable error classification.
//!
//! Uses `backon` for exponential backoff with jitter. `retry_forever` is the
//! one unbounded loop, reserved for establishing the broker connection.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use backon::ExponentialBuilder;
use tracing::{info, warn};

use crate::broker::BrokerError;

/// Backoff for publish retries (notification producer).
///
/// - Min delay: 100ms
/// - Max delay: 5s
/// - Max attempts: 5
/// - Jitter enabled
pub fn publish_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(5)
        .with_jitter()
}

/// Determines if a broker error is worth retrying.
///
/// Retryable:
/// - `Unavailable`: connection or channel failure, confirm nack
///
/// Non-retryable:
/// - `DurabilityConflict` and other precondition errors. These need an
///   operator and will never succeed on retry.
pub fn is_retryable(err: &BrokerError) -> bool {
    err.is_transient()
}

/// Run `attempt` until it succeeds, sleeping a fixed `delay` after every
/// failure. Each failure is logged with its attempt number.
pub async fn retry_forever<T, E, F, Fut>(delay: Duration, target: &str, mut attempt: F) -> T
where
    E: Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempts: u64 = 0;
    loop {
        attempts += 1;
        match attempt().await {
            Ok(value) => {
                if attempts > 1 {
                    info!(target = %target, attempts, "Succeeded after retrying");
                }
                return value;
            }
            Err(e) => {
                warn!(
                    target = %target,
                    attempt = attempts,
                    error = %e,
                    retry_in = ?delay,
                    "Attempt failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
