//! Shared utilities for integration tests.
//!
//! Wires workers, clients and consumers onto separate connections of one
//! in-memory broker, the way separate processes share a RabbitMQ server.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use rpcbus::broker::{BrokerError, MemoryBroker, PublishOnly, RequestReply};
use rpcbus::notify::NotificationPublisher;
use rpcbus::ocr::{OcrEngine, OcrHandler, OcrRequest};
use rpcbus::rpc::{RequestHandler, RpcClient, RpcClientConfig, RpcWorker, RpcWorkerConfig};

pub const REQUEST_QUEUE: &str = "ocr_service";
pub const NOTIFICATION_QUEUE: &str = "email_notification";

/// A running role and the switch that stops it.
pub struct Running {
    pub shutdown: watch::Sender<bool>,
    pub handle: JoinHandle<Result<(), BrokerError>>,
}

impl Running {
    pub async fn stop(self) -> Result<(), BrokerError> {
        let _ = self.shutdown.send(true);
        self.handle.await.expect("role task panicked")
    }
}

pub fn request_reply(broker: &MemoryBroker) -> RequestReply {
    RequestReply::new(Arc::new(broker.connection()))
}

pub fn worker_config(prefetch: u16) -> RpcWorkerConfig {
    RpcWorkerConfig {
        queue: REQUEST_QUEUE.to_string(),
        durable: false,
        prefetch,
    }
}

pub fn client_config(timeout: Duration) -> RpcClientConfig {
    RpcClientConfig {
        request_queue: REQUEST_QUEUE.to_string(),
        request_queue_durable: false,
        default_timeout: timeout,
    }
}

/// Start a worker on its own connection.
pub fn start_worker<H: RequestHandler>(
    broker: &MemoryBroker,
    handler: H,
    prefetch: u16,
) -> Running {
    let worker = RpcWorker::new(request_reply(broker), handler, worker_config(prefetch));
    let (shutdown, rx) = watch::channel(false);
    let handle = tokio::spawn(async move { worker.run(rx).await });
    Running { shutdown, handle }
}

/// OCR handler that also publishes result notifications on its own connection.
pub fn ocr_handler_with_notifications(
    broker: &MemoryBroker,
    engine: Arc<dyn OcrEngine>,
) -> OcrHandler {
    let publisher = NotificationPublisher::new(
        PublishOnly::new(Arc::new(broker.connection())),
        NOTIFICATION_QUEUE,
    );
    OcrHandler::new(engine).with_notifications(publisher, "Your OCR result")
}

pub async fn start_client(broker: &MemoryBroker, timeout: Duration) -> RpcClient {
    RpcClient::start(request_reply(broker), client_config(timeout))
        .await
        .expect("Failed to start RPC client")
}

pub fn ocr_request(file: &str) -> OcrRequest {
    OcrRequest {
        user_name: "ann".to_string(),
        user_email: "ann@example.com".to_string(),
        user_id: "42".to_string(),
        file: file.to_string(),
    }
}

/// Poll until `condition` holds, failing the test after two seconds.
pub async fn wait_until<F: Fn() -> bool>(condition: F) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached within 2s");
}
