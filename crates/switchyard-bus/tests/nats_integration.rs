//! Message bus over a live NATS server with JetStream.
//!
//! Ignored by default. Run with a server at `NATS_URL` (default
//! `nats://localhost:4222`), e.g. `nats-server -js`, and `--ignored`.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use switchyard_bus::*;
use switchyard_core::SwitchyardError;
use tokio::sync::mpsc;
use uuid::Uuid;

fn config() -> BusConfig {
    BusConfig {
        url: std::env::var("NATS_URL").unwrap_or_else(|_| "nats://localhost:4222".into()),
        // A fresh prefix per run keeps streams from earlier runs out of the way.
        subject_prefix: format!("sy{}", Uuid::new_v4().simple()),
        max_reconnect_attempts: 1,
        ..BusConfig::default()
    }
}

#[tokio::test]
#[ignore = "needs a NATS server with JetStream"]
async fn test_manual_ack_task_is_redelivered_by_jetstream() {
    let bus = MessageBus::try_new(config()).unwrap();
    bus.start().await.unwrap();
    assert!(bus.health_check().await.persistence_enabled);

    let attempts = Arc::new(AtomicU32::new(0));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let seen = Arc::clone(&attempts);
    let pattern = bus.subjects().pattern(SubjectCategory::Tasks);
    bus.subscribe(
        &pattern,
        handler_fn(move |message: MessageContent| {
            let seen = Arc::clone(&seen);
            let tx = tx.clone();
            async move {
                if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                    return Err(SwitchyardError::Agent("first attempt fails".into()));
                }
                let _ = tx.send(message);
                Ok(())
            }
        }),
        SubscribeOptions::default().manual_ack(),
    )
    .await
    .unwrap();

    let task_id = bus
        .distribute_task("lint", json!({"file": "lib.rs"}), None, Priority::Normal)
        .await;
    let delivered = tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("no redelivery within 10s")
        .unwrap();
    assert_eq!(delivered.correlation_id.as_deref(), Some(task_id.as_str()));
    assert_eq!(delivered.retry_count, 1);
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    bus.stop().await;
}

#[tokio::test]
#[ignore = "needs a NATS server with JetStream"]
async fn test_request_response_across_connections() {
    let config = config();
    let server = MessageBus::try_new(config.clone()).unwrap();
    let client = MessageBus::try_new(config).unwrap();
    server.start().await.unwrap();
    client.start().await.unwrap();

    let responder = server.clone();
    server
        .subscribe(
            "rpc.ping",
            handler_fn(move |request: MessageContent| {
                let bus = responder.clone();
                async move {
                    bus.respond(&request, json!({"pong": true}), Some("server"))
                        .await;
                    Ok(())
                }
            }),
            SubscribeOptions::default(),
        )
        .await
        .unwrap();

    let response = client
        .request(
            "rpc.ping",
            MessageContent::new(MessageType::Request),
            Some(Duration::from_secs(5)),
        )
        .await
        .unwrap()
        .expect("server answered");
    assert_eq!(response.payload["pong"], true);
    assert_eq!(response.sender_id.as_deref(), Some("server"));

    client.stop().await;
    server.stop().await;
}
