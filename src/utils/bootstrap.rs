//! Bootstrap utilities for rpcbus binaries.
//!
//! Shared initialization code: tracing, config path, shutdown signal, and
//! the connect → run → reconnect supervision loop.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::broker::BrokerError;
use crate::config::LOG_ENV_VAR;

/// Initialize tracing with RPCBUS_LOG environment variable.
///
/// Defaults to "info" level if RPCBUS_LOG is not set.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Config path from `--config <path>` on the command line.
pub fn parse_config_path() -> Option<String> {
    config_path_from(std::env::args().skip(1))
}

fn config_path_from(mut args: impl Iterator<Item = String>) -> Option<String> {
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next();
        }
        if let Some(path) = arg.strip_prefix("--config=") {
            return Some(path.to_string());
        }
    }
    None
}

/// Shutdown flag flipped to `true` on Ctrl+C or SIGTERM.
///
/// Clone the receiver into every long-running loop of the process.
pub fn shutdown_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutdown signal received");
        let _ = tx.send(true);
    });
    rx
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

/// Resolve once shutdown has been requested.
///
/// If the sender is gone without requesting shutdown, never resolves.
pub async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Connection handed to each supervised round.
#[async_trait]
pub trait Session: Clone + Send + Sync {
    /// Tear down after a round ends. Failures are logged, not returned.
    async fn release(&self);
}

#[cfg(feature = "amqp")]
#[async_trait]
impl Session for crate::broker::AmqpConnection {
    async fn release(&self) {
        if !self.is_connected() {
            return;
        }
        if let Err(e) = self.close().await {
            warn!(error = %e, "Failed to close AMQP connection");
        }
    }
}

/// Run a broker role until shutdown, reconnecting whenever it fails with a
/// transient broker error.
///
/// Each round connects (retrying forever), hands the connection to `run`,
/// and closes it afterwards. Non-transient errors such as a durability
/// conflict end supervision and are returned.
#[cfg(feature = "amqp")]
pub async fn run_with_reconnect<F, Fut>(
    settings: &crate::config::AmqpSettings,
    shutdown: watch::Receiver<bool>,
    run: F,
) -> Result<(), BrokerError>
where
    F: FnMut(crate::broker::AmqpConnection, watch::Receiver<bool>) -> Fut,
    Fut: Future<Output = Result<(), BrokerError>>,
{
    supervise(
        settings.retry_delay(),
        shutdown,
        || crate::broker::AmqpConnection::connect(settings),
        run,
    )
    .await
}

/// The loop behind `run_with_reconnect`, over any session type.
///
/// Waits `retry_delay` between a transient failure and the next connect.
/// Shutdown while connecting or waiting ends supervision with `Ok(())`.
pub async fn supervise<S, C, CFut, F, Fut>(
    retry_delay: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut connect: C,
    mut run: F,
) -> Result<(), BrokerError>
where
    S: Session,
    C: FnMut() -> CFut,
    CFut: Future<Output = S>,
    F: FnMut(S, watch::Receiver<bool>) -> Fut,
    Fut: Future<Output = Result<(), BrokerError>>,
{
    loop {
        let session = tokio::select! {
            session = connect() => session,
            _ = wait_for_shutdown(&mut shutdown) => return Ok(()),
        };

        let result = run(session.clone(), shutdown.clone()).await;
        session.release().await;

        match result {
            Ok(()) => return Ok(()),
            Err(e) if e.is_transient() => {
                warn!(error = %e, retry_in = ?retry_delay, "Broker role stopped, reconnecting");
                tokio::select! {
                    _ = tokio::time::sleep(retry_delay) => {}
                    _ = wait_for_shutdown(&mut shutdown) => return Ok(()),
                }
            }
            Err(e) => {
                error!(error = %e, "Broker role failed");
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn args(list: &[&str]) -> impl Iterator<Item = String> {
        list.iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>()
            .into_iter()
    }

    #[test]
    fn test_config_path_from_args() {
        assert_eq!(
            config_path_from(args(&["--config", "svc.yaml"])),
            Some("svc.yaml".to_string())
        );
        assert_eq!(
            config_path_from(args(&["--config=svc.yaml"])),
            Some("svc.yaml".to_string())
        );
        assert_eq!(config_path_from(args(&["file.png"])), None);
    }

    #[tokio::test]
    async fn test_wait_for_shutdown_resolves_on_flag() {
        let (tx, mut rx) = watch::channel(false);
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), wait_for_shutdown(&mut rx))
            .await
            .expect("shutdown not observed");
    }

    #[tokio::test]
    async fn test_wait_for_shutdown_pends_when_sender_dropped() {
        let (tx, mut rx) = watch::channel(false);
        drop(tx);
        let result =
            tokio::time::timeout(Duration::from_millis(20), wait_for_shutdown(&mut rx)).await;
        assert!(result.is_err());
    }

    #[derive(Clone, Default)]
    struct CountingSession {
        released: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Session for CountingSession {
        async fn release(&self) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    const RETRY: Duration = Duration::from_secs(5);

    #[tokio::test(start_paused = true)]
    async fn test_supervise_reconnects_after_transient_failure() {
        let session = CountingSession::default();
        let connects = AtomicUsize::new(0);
        let rounds = AtomicUsize::new(0);
        let (_tx, rx) = watch::channel(false);
        let started = tokio::time::Instant::now();

        let result = supervise(
            RETRY,
            rx,
            || {
                connects.fetch_add(1, Ordering::SeqCst);
                let session = session.clone();
                async move { session }
            },
            |_session, _shutdown| {
                let round = rounds.fetch_add(1, Ordering::SeqCst);
                async move {
                    if round < 2 {
                        Err(BrokerError::Unavailable("connection reset".to_string()))
                    } else {
                        Ok(())
                    }
                }
            },
        )
        .await;

        assert_eq!(result, Ok(()));
        assert_eq!(connects.load(Ordering::SeqCst), 3);
        assert_eq!(rounds.load(Ordering::SeqCst), 3);
        assert_eq!(session.released.load(Ordering::SeqCst), 3);
        assert_eq!(started.elapsed(), RETRY * 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_supervise_stops_on_durability_conflict() {
        let session = CountingSession::default();
        let rounds = AtomicUsize::new(0);
        let (_tx, rx) = watch::channel(false);
        let conflict = BrokerError::DurabilityConflict {
            queue: "email_notification".to_string(),
            requested: true,
        };

        let result = supervise(
            RETRY,
            rx,
            || {
                let session = session.clone();
                async move { session }
            },
            |_session, _shutdown| {
                rounds.fetch_add(1, Ordering::SeqCst);
                let err = conflict.clone();
                async move { Err(err) }
            },
        )
        .await;

        assert_eq!(result, Err(conflict));
        assert_eq!(rounds.load(Ordering::SeqCst), 1);
        assert_eq!(session.released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_supervise_shutdown_during_backoff() {
        let (tx, rx) = watch::channel(false);
        let rounds = AtomicUsize::new(0);
        let started = tokio::time::Instant::now();

        let result = supervise(
            RETRY,
            rx,
            || async { CountingSession::default() },
            |_session, _shutdown| {
                rounds.fetch_add(1, Ordering::SeqCst);
                let _ = tx.send(true);
                async { Err(BrokerError::Unavailable("gone".to_string())) }
            },
        )
        .await;

        assert_eq!(result, Ok(()));
        assert_eq!(rounds.load(Ordering::SeqCst), 1);
        assert!(started.elapsed() < RETRY);
    }

    #[tokio::test(start_paused = true)]
    async fn test_supervise_shutdown_while_connecting() {
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();

        let result = supervise(
            RETRY,
            rx,
            std::future::pending::<CountingSession>,
            |_session, _shutdown| async { Ok(()) },
        )
        .await;

        assert_eq!(result, Ok(()));
    }
}
