use super::client::PendingCalls;
use super::*;
use crate::broker::{Broker, BrokerError, Envelope, MemoryBroker, Publisher, RequestReply};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

const QUEUE: &str = "ocr_service";

#[derive(Debug, Serialize, Deserialize)]
struct EchoRequest {
    text: String,
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct EchoResponse {
    text: String,
    upper: String,
}

struct EchoHandler;

#[async_trait]
impl RequestHandler for EchoHandler {
    type Request = EchoRequest;
    type Response = EchoResponse;

    async fn handle(
        &self,
        request: EchoRequest,
    ) -> std::result::Result<EchoResponse, HandlerError> {
        Ok(EchoResponse {
            upper: request.text.to_uppercase(),
            text: request.text,
        })
    }
}

struct FailingHandler {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl RequestHandler for FailingHandler {
    type Request = EchoRequest;
    type Response = EchoResponse;

    async fn handle(
        &self,
        _request: EchoRequest,
    ) -> std::result::Result<EchoResponse, HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(HandlerError::Processing("engine crashed".to_string()))
    }
}

/// Never finishes, so every delivery it takes stays unacked.
struct StuckHandler;

#[async_trait]
impl RequestHandler for StuckHandler {
    type Request = EchoRequest;
    type Response = EchoResponse;

    async fn handle(
        &self,
        _request: EchoRequest,
    ) -> std::result::Result<EchoResponse, HandlerError> {
        std::future::pending().await
    }
}

fn client_config(timeout: Duration) -> RpcClientConfig {
    RpcClientConfig {
        request_queue: QUEUE.to_string(),
        request_queue_durable: false,
        default_timeout: timeout,
    }
}

fn worker_config(prefetch: u16) -> RpcWorkerConfig {
    RpcWorkerConfig {
        queue: QUEUE.to_string(),
        durable: false,
        prefetch,
    }
}

fn spawn_worker<H: RequestHandler>(
    broker: &MemoryBroker,
    handler: H,
    prefetch: u16,
) -> (
    watch::Sender<bool>,
    JoinHandle<std::result::Result<(), BrokerError>>,
) {
    let view = RequestReply::new(Arc::new(broker.connection()));
    let worker = RpcWorker::new(view, handler, worker_config(prefetch));
    let (tx, rx) = watch::channel(false);
    let handle = tokio::spawn(async move { worker.run(rx).await });
    (tx, handle)
}

async fn start_client(broker: &MemoryBroker, timeout: Duration) -> RpcClient {
    let view = RequestReply::new(Arc::new(broker.connection()));
    RpcClient::start(view, client_config(timeout)).await.unwrap()
}

async fn wait_until<F: Fn() -> bool>(condition: F) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached");
}

// ============================================================================
// Pending calls
// ============================================================================

#[tokio::test]
async fn test_pending_calls_fulfill_delivers_reply() {
    let pending = PendingCalls::default();
    let rx = pending.register("c1").unwrap();

    assert!(pending.fulfill("c1", Envelope::new("r1")));

    let reply = rx.await.unwrap();
    assert_eq!(&reply.body[..], b"r1");
    assert_eq!(pending.len(), 0);
}

#[test]
fn test_pending_calls_rejects_duplicate_id() {
    let pending = PendingCalls::default();
    let _rx = pending.register("c1").unwrap();

    let result = pending.register("c1");

    assert!(matches!(result, Err(RpcError::DuplicateCorrelationId(id)) if id == "c1"));
}

#[test]
fn test_pending_calls_unknown_id_is_not_fulfilled() {
    let pending = PendingCalls::default();
    let _rx = pending.register("c1").unwrap();

    assert!(!pending.fulfill("c9", Envelope::new("stray")));
    assert_eq!(pending.len(), 1);
}

#[tokio::test]
async fn test_pending_calls_close_fails_waiters() {
    let pending = PendingCalls::default();
    let rx = pending.register("c1").unwrap();

    assert_eq!(pending.close(), 1);

    assert!(rx.await.is_err());
    assert!(matches!(
        pending.register("c2"),
        Err(RpcError::Broker(BrokerError::Unavailable(_)))
    ));
}

// ============================================================================
// Client and worker
// ============================================================================

#[tokio::test]
async fn test_call_returns_handler_response() {
    let broker = MemoryBroker::new();
    let (shutdown, worker) = spawn_worker(&broker, EchoHandler, 1);
    let client = start_client(&broker, Duration::from_secs(2)).await;

    let response: EchoResponse = client
        .call(&EchoRequest {
            text: "abc".to_string(),
        })
        .await
        .unwrap();

    assert_eq!(
        response,
        EchoResponse {
            text: "abc".to_string(),
            upper: "ABC".to_string(),
        }
    );
    assert_eq!(client.pending_calls(), 0);
    assert_eq!(broker.queue_stats(QUEUE).unwrap().acked, 1);

    shutdown.send(true).unwrap();
    assert_eq!(worker.await.unwrap(), Ok(()));
}

#[tokio::test]
async fn test_reply_queue_is_private_and_generated() {
    let broker = MemoryBroker::new();
    let client = start_client(&broker, Duration::from_secs(1)).await;

    assert!(client.reply_queue().starts_with("amq.gen-"));
    assert!(broker.queue_exists(client.reply_queue()));

    let reply_queue = client.reply_queue().to_string();
    drop(client);
    wait_until(|| !broker.queue_exists(&reply_queue)).await;
}

#[tokio::test]
async fn test_concurrent_calls_get_their_own_replies() {
    let broker = MemoryBroker::new();
    let (_shutdown, _worker) = spawn_worker(&broker, EchoHandler, 4);
    let client = start_client(&broker, Duration::from_secs(2)).await;

    let calls = (0..16).map(|i| {
        let client = &client;
        async move {
            let text = format!("req-{i}");
            let response: EchoResponse = client.call(&EchoRequest { text: text.clone() }).await?;
            Ok::<_, RpcError>((text, response))
        }
    });
    let results = futures::future::join_all(calls).await;

    for result in results {
        let (text, response) = result.unwrap();
        assert_eq!(response.upper, text.to_uppercase());
        assert_eq!(response.text, text);
    }
    assert_eq!(client.pending_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_call_times_out_at_deadline() {
    let broker = MemoryBroker::new();
    let client = start_client(&broker, Duration::from_secs(30)).await;
    let started = tokio::time::Instant::now();

    let result: Result<EchoResponse> = client
        .call_with_timeout(
            &EchoRequest {
                text: "nobody home".to_string(),
            },
            Duration::from_secs(5),
        )
        .await;

    assert!(matches!(result, Err(RpcError::Timeout(t)) if t == Duration::from_secs(5)));
    assert_eq!(started.elapsed(), Duration::from_secs(5));
    assert_eq!(client.pending_calls(), 0);
    // The request is still queued for a worker that may show up later.
    assert_eq!(broker.queue_stats(QUEUE).unwrap().ready, 1);
}

#[tokio::test]
async fn test_unbounded_timeout_still_gets_reply() {
    let broker = MemoryBroker::new();
    let (_shutdown, _worker) = spawn_worker(&broker, EchoHandler, 1);
    let client = start_client(&broker, Duration::from_secs(u64::MAX)).await;

    let response: EchoResponse = client
        .call(&EchoRequest {
            text: "long wait".to_string(),
        })
        .await
        .unwrap();
    assert_eq!(response.upper, "LONG WAIT");

    let raw = client
        .call_raw(Bytes::from_static(br#"{"text":"x"}"#), Duration::MAX)
        .await
        .unwrap();
    let decoded: EchoResponse = serde_json::from_slice(&raw).unwrap();
    assert_eq!(decoded.upper, "X");
    assert_eq!(client.pending_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_unbounded_timeout_waits_for_late_worker() {
    let broker = MemoryBroker::new();
    let client = start_client(&broker, Duration::MAX).await;
    let request = EchoRequest {
        text: "later".to_string(),
    };

    let call = client.call::<_, EchoResponse>(&request);
    let late_worker = async {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        spawn_worker(&broker, EchoHandler, 1)
    };

    let (result, _worker) = tokio::join!(call, late_worker);
    assert_eq!(result.unwrap().upper, "LATER");
}

#[tokio::test]
async fn test_late_reply_is_discarded() {
    let broker = MemoryBroker::new();
    let client = start_client(&broker, Duration::from_secs(1)).await;

    let result: Result<EchoResponse> = client
        .call_with_timeout(
            &EchoRequest {
                text: "slow".to_string(),
            },
            Duration::from_millis(20),
        )
        .await;
    assert!(matches!(result, Err(RpcError::Timeout(_))));

    // Answer the expired request by hand.
    let replier = broker.connection();
    let mut requests = replier
        .consume(QUEUE, crate::broker::ConsumeOptions::default())
        .await
        .unwrap();
    let request = futures::StreamExt::next(&mut requests)
        .await
        .unwrap()
        .unwrap();
    let reply = Envelope::json(&EchoResponse {
        text: "slow".to_string(),
        upper: "SLOW".to_string(),
    })
    .unwrap()
    .with_correlation_id(request.envelope.correlation_id.clone().unwrap());
    replier
        .publish(request.envelope.reply_to.as_deref().unwrap(), reply)
        .await
        .unwrap();
    request.ack().await.unwrap();

    let reply_queue = client.reply_queue().to_string();
    wait_until(|| broker.queue_stats(&reply_queue).unwrap().delivered == 1).await;
    assert_eq!(client.pending_calls(), 0);
}

#[tokio::test]
async fn test_handler_failure_drops_request_without_retry() {
    let broker = MemoryBroker::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let (_shutdown, _worker) = spawn_worker(
        &broker,
        FailingHandler {
            calls: calls.clone(),
        },
        1,
    );
    let client = start_client(&broker, Duration::from_secs(1)).await;

    let result: Result<EchoResponse> = client
        .call_with_timeout(
            &EchoRequest {
                text: "boom".to_string(),
            },
            Duration::from_millis(200),
        )
        .await;

    assert!(matches!(result, Err(RpcError::Timeout(_))));
    let stats = broker.queue_stats(QUEUE).unwrap();
    assert_eq!(stats.dropped, 1);
    assert_eq!(stats.delivered, 1);
    assert_eq!(stats.ready, 0);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_zero_prefetch_takes_one_request_at_a_time() {
    let broker = MemoryBroker::new();
    let (_shutdown, _worker) = spawn_worker(&broker, StuckHandler, 0);
    wait_until(|| broker.queue_exists(QUEUE)).await;

    for i in 0..3 {
        let request = Envelope::json(&EchoRequest {
            text: format!("r{i}"),
        })
        .unwrap()
        .with_correlation_id(format!("c{i}"))
        .with_reply_to("replies");
        broker.publish(QUEUE, request).await.unwrap();
    }

    wait_until(|| broker.queue_stats(QUEUE).unwrap().unacked == 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let stats = broker.queue_stats(QUEUE).unwrap();
    assert_eq!(stats.unacked, 1);
    assert_eq!(stats.ready, 2);
}

#[tokio::test]
async fn test_worker_rejects_request_without_reply_to() {
    let broker = MemoryBroker::new();
    let (_shutdown, _worker) = spawn_worker(&broker, EchoHandler, 1);
    wait_until(|| broker.queue_exists(QUEUE)).await;

    let envelope = Envelope::json(&EchoRequest {
        text: "orphan".to_string(),
    })
    .unwrap()
    .with_correlation_id("c1");
    broker.publish(QUEUE, envelope).await.unwrap();

    wait_until(|| broker.queue_stats(QUEUE).unwrap().dropped == 1).await;
    assert_eq!(broker.queue_stats(QUEUE).unwrap().acked, 0);
}

#[tokio::test]
async fn test_worker_rejects_undecodable_request() {
    let broker = MemoryBroker::new();
    let (_shutdown, _worker) = spawn_worker(&broker, EchoHandler, 1);
    let client = start_client(&broker, Duration::from_secs(1)).await;

    let result = client
        .call_raw(Bytes::from_static(b"not json"), Duration::from_millis(100))
        .await;

    assert!(matches!(result, Err(RpcError::Timeout(_))));
    assert_eq!(broker.queue_stats(QUEUE).unwrap().dropped, 1);
}

#[tokio::test]
async fn test_undecodable_reply_is_decode_error() {
    let broker = MemoryBroker::new();
    let (_shutdown, _worker) = spawn_worker(&broker, EchoHandler, 1);
    let client = start_client(&broker, Duration::from_secs(1)).await;

    #[derive(Debug, Deserialize)]
    struct Unexpected {
        #[allow(dead_code)]
        missing_field: u32,
    }

    let result: Result<Unexpected> = client
        .call(&EchoRequest {
            text: "abc".to_string(),
        })
        .await;

    assert!(matches!(result, Err(RpcError::Decode(_))));
}

#[tokio::test]
async fn test_call_after_broker_loss_is_unavailable() {
    let broker = MemoryBroker::new();
    let client = start_client(&broker, Duration::from_secs(1)).await;

    broker.close_all();

    let result: Result<EchoResponse> = client
        .call(&EchoRequest {
            text: "abc".to_string(),
        })
        .await;

    match result {
        Err(err @ RpcError::Broker(BrokerError::Unavailable(_))) => {
            assert_eq!(err.http_status(), http::StatusCode::SERVICE_UNAVAILABLE);
        }
        other => panic!("expected Unavailable, got {other:?}"),
    }
}

#[tokio::test]
async fn test_worker_stops_with_unavailable_on_broker_loss() {
    let broker = MemoryBroker::new();
    let (_shutdown, worker) = spawn_worker(&broker, EchoHandler, 1);
    wait_until(|| broker.queue_exists(QUEUE)).await;

    broker.close_all();

    let result = tokio::time::timeout(Duration::from_secs(1), worker)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(BrokerError::Unavailable(_))));
}

#[tokio::test]
async fn test_client_rejects_durability_mismatch() {
    let broker = MemoryBroker::new();
    broker
        .declare_queue(&crate::broker::QueueSpec::durable(QUEUE))
        .await
        .unwrap();

    let view = RequestReply::new(Arc::new(broker.connection()));
    let result = RpcClient::start(view, client_config(Duration::from_secs(1))).await;

    assert!(matches!(
        result,
        Err(RpcError::Broker(BrokerError::DurabilityConflict { .. }))
    ));
}

#[test]
fn test_http_status_mapping() {
    use http::StatusCode;

    assert_eq!(
        RpcError::Timeout(Duration::from_secs(1)).http_status(),
        StatusCode::GATEWAY_TIMEOUT
    );
    assert_eq!(
        RpcError::Broker(BrokerError::Unavailable("down".into())).http_status(),
        StatusCode::SERVICE_UNAVAILABLE
    );
    let decode = serde_json::from_slice::<EchoResponse>(b"{").unwrap_err();
    assert_eq!(
        RpcError::Decode(decode).http_status(),
        StatusCode::BAD_GATEWAY
    );
    assert_eq!(
        RpcError::DuplicateCorrelationId("c1".into()).http_status(),
        StatusCode::INTERNAL_SERVER_ERROR
    );
}
