//! Tests against a live Kafka broker.
//!
//! Run with `cargo test --features kafka -- --ignored`; the broker address
//! comes from `KAFKA_BOOTSTRAP_SERVERS`.
#![cfg(feature = "kafka")]

use forge_events::{BusConfig, BusKind, Callback, EventBus, KafkaEventBus, Message};
use serde_json::json;
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::mpsc;

fn broker_config() -> BusConfig {
    let mut config = BusConfig::from_env().unwrap();
    config.implementation = BusKind::Kafka;
    config
}

fn unique_topic(prefix: &str) -> String {
    format!("{prefix}-{}", uuid::Uuid::new_v4())
}

#[tokio::test]
#[ignore = "requires a running Kafka broker"]
async fn test_publish_subscribe_roundtrip() {
    let config = broker_config();
    let bus = KafkaEventBus::new(config.kafka.clone(), config.timeouts);
    bus.start().await.unwrap();

    let topic = unique_topic("forge-events-it");
    let (tx, mut rx) = mpsc::unbounded_channel();
    bus.subscribe(
        &topic,
        Callback::from_fn(move |message| {
            let _ = tx.send(message);
            Ok(())
        }),
    )
    .await
    .unwrap();

    // Latest-offset consumers miss anything published before assignment.
    tokio::time::sleep(Duration::from_secs(5)).await;

    bus.publish(Message::new(topic.clone(), json!("first"))).await.unwrap();
    bus.publish(Message::new(topic.clone(), json!("second"))).await.unwrap();

    // Three partitions, no key: only the set of delivered payloads is stable.
    let mut received = HashSet::new();
    for _ in 0..2 {
        let message = tokio::time::timeout(Duration::from_secs(20), rx.recv())
            .await
            .unwrap()
            .unwrap();
        received.insert(message.payload().as_str().unwrap().to_string());
    }
    assert_eq!(received, HashSet::from(["first".to_string(), "second".to_string()]));

    bus.stop().await;
    assert!(!bus.is_started().await);
}

#[tokio::test]
#[ignore = "requires a running Kafka broker"]
async fn test_create_topics_is_idempotent() {
    let config = broker_config();
    let bus = KafkaEventBus::new(config.kafka.clone(), config.timeouts);
    bus.start().await.unwrap();

    let topics = vec![unique_topic("forge-events-create")];
    bus.create_topics(&topics).await.unwrap();
    bus.create_topics(&topics).await.unwrap();

    bus.stop().await;
    bus.stop().await;
}
