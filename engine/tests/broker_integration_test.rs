//! Integration tests for the bus broker
//!
//! Runs a real broker on an ephemeral port and talks to it through
//! `WsBus` clients, the same way separate coordinator and worker
//! processes do.

use courier_engine::daemon::Shutdown;
use courier_engine::message_bus::{Backoff, Broker, InMemoryBus, MessageBus, WsBus};
use courier_sdk::DispatchError;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

const TOKEN: &str = "integration-secret";

async fn start_broker(token: Option<&str>) -> (SocketAddr, Shutdown, JoinHandle<anyhow::Result<()>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = Shutdown::new();

    let broker = Broker::new(InMemoryBus::new(), token.map(str::to_string));
    let wait = shutdown.clone();
    let handle = tokio::spawn(broker.serve(listener, async move { wait.wait().await }));

    (addr, shutdown, handle)
}

fn backoff() -> Backoff {
    Backoff::new(Duration::from_millis(50), Duration::from_secs(1))
}

fn endpoint(addr: SocketAddr) -> String {
    format!("ws://{}/bus", addr)
}

#[tokio::test]
async fn test_health_endpoint() {
    let (addr, shutdown, handle) = start_broker(None).await;

    let body: serde_json::Value = reqwest::get(format!("http://{}/health", addr))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");

    shutdown.trigger();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_wrong_token_is_rejected() {
    let (addr, shutdown, handle) = start_broker(Some(TOKEN)).await;

    let err = WsBus::connect(&endpoint(addr), Some("wrong"), backoff())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, DispatchError::BusUnavailable(_)));

    let err = WsBus::connect(&endpoint(addr), None, backoff())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, DispatchError::BusUnavailable(_)));

    shutdown.trigger();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_publish_reaches_subscriber_in_other_client() {
    let (addr, shutdown, handle) = start_broker(Some(TOKEN)).await;

    let worker = WsBus::connect(&endpoint(addr), Some(TOKEN), backoff())
        .await
        .unwrap();
    let coordinator = WsBus::connect(&endpoint(addr), Some(TOKEN), backoff())
        .await
        .unwrap();
    assert!(worker.is_connected());

    let mut tasks = worker.subscribe("document_tasks").await.unwrap();
    assert_eq!(coordinator.subscriber_count("document_tasks").await.unwrap(), 1);
    assert_eq!(coordinator.subscriber_count("audio_tasks").await.unwrap(), 0);

    coordinator
        .publish("document_tasks", "{\"hello\":1}".to_string())
        .await
        .unwrap();
    // Nobody listens here; the message is silently dropped
    coordinator
        .publish("image_tasks", "lost".to_string())
        .await
        .unwrap();

    let received = tokio::time::timeout(Duration::from_secs(5), tasks.recv())
        .await
        .unwrap();
    assert_eq!(received.as_deref(), Some("{\"hello\":1}"));

    shutdown.trigger();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_dropped_subscription_is_released() {
    let (addr, shutdown, handle) = start_broker(None).await;

    let worker = WsBus::connect(&endpoint(addr), None, backoff()).await.unwrap();
    let observer = WsBus::connect(&endpoint(addr), None, backoff()).await.unwrap();

    let subscription = worker.subscribe("results").await.unwrap();
    assert_eq!(observer.subscriber_count("results").await.unwrap(), 1);

    drop(subscription);

    let mut released = false;
    for _ in 0..50 {
        if observer.subscriber_count("results").await.unwrap() == 0 {
            released = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(released, "broker still counts the dropped subscription");

    shutdown.trigger();
    handle.await.unwrap().unwrap();
}

async fn wait_for_count(bus: &WsBus, channel: &str, expected: usize) -> bool {
    for _ in 0..100 {
        if bus.subscriber_count(channel).await.unwrap() == expected {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_released_on_multi_thread_runtime() {
    let (addr, shutdown, handle) = start_broker(None).await;

    let coordinator = WsBus::connect(&endpoint(addr), None, backoff()).await.unwrap();
    let observer = WsBus::connect(&endpoint(addr), None, backoff()).await.unwrap();

    // Per-conversation progress channels come and go all the time
    for round in 0..20 {
        let channel = format!("progress_{}", round % 3);
        let subscription = coordinator.subscribe(&channel).await.unwrap();
        assert!(wait_for_count(&observer, &channel, 1).await);

        drop(subscription);
        assert!(
            wait_for_count(&observer, &channel, 0).await,
            "round {}: broker still counts {}",
            round,
            channel
        );
    }

    shutdown.trigger();
    handle.await.unwrap().unwrap();
}
