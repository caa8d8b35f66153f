//! Behaviour shared by every messaging backend.
//!
//! The in-memory service runs unconditionally. The NATS and Redis cases need
//! a live server and only run when `SLURMFLOW_TEST_NATS_URL` or
//! `SLURMFLOW_TEST_REDIS_URL` is set.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rstest::rstest;
use slurmflow::messaging::handler;
use slurmflow::test_support::MemoryMessagingService;
use slurmflow::{
    ConnectOptions, HandlerError, MessagingBackend, MessagingError, MessagingService,
};
use tokio::sync::mpsc;
use tokio::time::timeout;

const DELIVERY_TIMEOUT: Duration = Duration::from_secs(5);

fn forwarding(tx: mpsc::UnboundedSender<Bytes>) -> slurmflow::MessageHandler {
    handler(move |payload| {
        let tx = tx.clone();
        async move {
            tx.send(payload)
                .map_err(|err| HandlerError::Failed(err.to_string()))
        }
    })
}

async fn exercise_backend(service: Arc<dyn MessagingService>, subject_root: &str) {
    let own = format!("{subject_root}.1");
    let other = format!("{subject_root}.2");

    service
        .publish(&own, Bytes::from_static(b"before"))
        .await
        .expect("publish before subscribe");

    let (tx, mut rx) = mpsc::unbounded_channel();
    service
        .subscribe(&own, forwarding(tx))
        .await
        .expect("subscribe");
    // Give network backends a moment to register the subscription.
    tokio::time::sleep(Duration::from_millis(200)).await;

    service
        .publish(&other, Bytes::from_static(b"elsewhere"))
        .await
        .expect("publish other");
    service
        .publish(&own, Bytes::from_static(b"after"))
        .await
        .expect("publish own");

    let received = timeout(DELIVERY_TIMEOUT, rx.recv())
        .await
        .expect("delivery in time")
        .expect("channel open");
    assert_eq!(received, Bytes::from_static(b"after"));
    assert!(
        timeout(Duration::from_millis(300), rx.recv()).await.is_err(),
        "no replay and no cross-subject delivery"
    );

    service.disconnect().await.expect("disconnect");
    service.disconnect().await.expect("second disconnect");
    assert!(!service.is_connected());
    let err = service
        .publish(&own, Bytes::from_static(b"late"))
        .await
        .expect_err("publish after disconnect");
    assert!(matches!(err, MessagingError::NotConnected { .. }));
}

#[tokio::test]
async fn memory_backend_honours_the_contract() {
    let service: Arc<dyn MessagingService> = Arc::new(MemoryMessagingService::connected());
    exercise_backend(service, "simulator").await;
}

#[tokio::test]
async fn memory_backend_rejects_use_before_connect() {
    let service = MemoryMessagingService::new();
    let err = service
        .subscribe("simulator.1", handler(|_| async { Ok(()) }))
        .await
        .expect_err("not connected");
    assert_eq!(err, MessagingError::NotConnected { backend: "memory" });
}

#[tokio::test]
async fn failing_handler_does_not_stop_delivery() {
    let service = MemoryMessagingService::connected();
    let (tx, mut rx) = mpsc::unbounded_channel();
    service
        .subscribe(
            "simulator.9",
            handler(|_| async { Err(HandlerError::Decode(String::from("garbage"))) }),
        )
        .await
        .expect("subscribe failing");
    service
        .subscribe("simulator.9", forwarding(tx))
        .await
        .expect("subscribe forwarding");

    service
        .publish("simulator.9", Bytes::from_static(b"{}"))
        .await
        .expect("publish");

    assert_eq!(rx.try_recv().expect("delivered"), Bytes::from_static(b"{}"));
}

#[rstest]
#[case::nats(MessagingBackend::Nats, "SLURMFLOW_TEST_NATS_URL")]
#[case::redis(MessagingBackend::Redis, "SLURMFLOW_TEST_REDIS_URL")]
#[tokio::test]
async fn live_backend_honours_the_contract(
    #[case] backend: MessagingBackend,
    #[case] url_var: &str,
) {
    let Ok(url) = std::env::var(url_var) else {
        return;
    };
    let service = backend.service();
    service
        .connect(&url, &ConnectOptions::default())
        .await
        .expect("connect to live server");
    service
        .connect(&url, &ConnectOptions::default())
        .await
        .expect("second connect is a no-op");
    assert!(service.is_connected());

    let root = format!("slurmflow-test-{}", uuid::Uuid::new_v4().simple());
    exercise_backend(service, &root).await;
}

#[rstest]
#[case::nats(MessagingBackend::Nats, "SLURMFLOW_TEST_NATS_URL")]
#[case::redis(MessagingBackend::Redis, "SLURMFLOW_TEST_REDIS_URL")]
#[tokio::test]
async fn live_failing_handler_does_not_stop_delivery(
    #[case] backend: MessagingBackend,
    #[case] url_var: &str,
) {
    let Ok(url) = std::env::var(url_var) else {
        return;
    };
    let service = backend.service();
    service
        .connect(&url, &ConnectOptions::default())
        .await
        .expect("connect to live server");

    let root = format!("slurmflow-test-{}", uuid::Uuid::new_v4().simple());
    let broken = format!("{root}.1");
    let healthy = format!("{root}.2");
    service
        .subscribe(
            &broken,
            handler(|_| async { Err(HandlerError::Decode(String::from("garbage"))) }),
        )
        .await
        .expect("subscribe failing");
    let (tx, mut rx) = mpsc::unbounded_channel();
    service
        .subscribe(&healthy, forwarding(tx))
        .await
        .expect("subscribe forwarding");
    tokio::time::sleep(Duration::from_millis(200)).await;

    let payloads: [&'static [u8]; 2] = [b"first", b"second"];
    for payload in payloads {
        service
            .publish(&broken, Bytes::from_static(payload))
            .await
            .expect("publish to failing subject");
        service
            .publish(&healthy, Bytes::from_static(payload))
            .await
            .expect("publish to healthy subject");
    }

    for expected in payloads {
        let received = timeout(DELIVERY_TIMEOUT, rx.recv())
            .await
            .expect("delivery in time")
            .expect("channel open");
        assert_eq!(received, Bytes::from_static(expected));
    }
    service.disconnect().await.expect("disconnect");
}

#[tokio::test]
async fn unreachable_server_is_a_connect_error() {
    let service = MessagingBackend::Nats.service();
    let options = ConnectOptions {
        connect_timeout: Duration::from_millis(500),
        ..ConnectOptions::default()
    };
    let err = service
        .connect("nats://127.0.0.1:1", &options)
        .await
        .expect_err("nothing listens on port 1");
    assert!(matches!(err, MessagingError::Connect { .. }));
    assert!(!service.is_connected());
}
