//! rpcbus-worker: OCR RPC worker
//!
//! Consumes the request queue, runs OCR on each uploaded document, and
//! replies on the caller's private reply queue. Optionally emails the result
//! through the notification queue.
//!
//! ## Architecture
//! ```text
//! [caller] --(ocr_service)--> [rpcbus-worker] --(reply_to)--> [caller]
//!                                   |
//!                                   v
//!                          (email_notification)
//! ```
//!
//! ## Configuration
//! - `--config <path>` or RPCBUS_CONFIG: YAML config file
//! - RPCBUS__AMQP__URL: Broker URL (default: amqp://localhost:5672)
//! - RPCBUS__RPC__PREFETCH: Requests processed concurrently (default: 1)
//! - RPCBUS_LOG: Log filter (default: info)

use std::sync::Arc;

use tracing::info;

use rpcbus::broker::{PublishOnly, RequestReply};
use rpcbus::config::Config;
use rpcbus::notify::NotificationPublisher;
use rpcbus::ocr::{engine_from_settings, OcrHandler};
use rpcbus::rpc::{RpcWorker, RpcWorkerConfig};
use rpcbus::utils::bootstrap::{
    init_tracing, parse_config_path, run_with_reconnect, shutdown_signal,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = Config::load(parse_config_path().as_deref())?;
    let engine = engine_from_settings(&config.ocr);
    let shutdown = shutdown_signal();

    info!(
        queue = %config.rpc.request_queue,
        prefetch = config.rpc.prefetch,
        engine = ?config.ocr.engine,
        "rpcbus-worker starting"
    );

    run_with_reconnect(&config.amqp, shutdown, |connection, shutdown| {
        let config = config.clone();
        let engine = engine.clone();
        async move {
            let rpc_channel = connection.open("rpc-worker").await?;

            let mut handler = OcrHandler::new(engine);
            if config.ocr.notify {
                let notify_channel = connection.open("notification-publisher").await?;
                let publisher = NotificationPublisher::new(
                    PublishOnly::new(Arc::new(notify_channel)),
                    config.notification.queue.clone(),
                );
                handler = handler.with_notifications(publisher, config.ocr.notify_subject.clone());
            }

            let worker = RpcWorker::new(
                RequestReply::new(Arc::new(rpc_channel)),
                handler,
                RpcWorkerConfig::from(&config.rpc),
            );
            worker.run(shutdown).await
        }
    })
    .await?;

    info!("rpcbus-worker stopped");
    Ok(())
}
