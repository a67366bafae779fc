//! Kafka-backed event bus.
//!
//! One producer and one admin client live for the whole started lifetime of
//! the bus. Every subscribed topic gets its own consumer, all consumers share
//! the configured consumer group and start from the latest offset, so
//! messages published before a topic's consumer is assigned are never
//! replayed to it.
//!
//! Topics are created with [`TOPIC_PARTITIONS`] partitions and no partition
//! key is set on publish. Ordering is therefore only guaranteed within a
//! partition: two messages published to the same topic may be delivered in
//! either order.

use crate::bus::{EventBus, EventBusStats};
use crate::config::{KafkaConfig, Timeouts};
use crate::error::{EventBusError, EventBusResult};
use crate::handler::Callback;
use crate::message::Message;
use crate::router::{MessageSource, TopicRouter};
use async_trait::async_trait;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use rdkafka::Message as KafkaMessage;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const NAME: &str = "kafka";

/// Partitions of every topic created by the bus.
pub const TOPIC_PARTITIONS: i32 = 3;

/// Replication factor of every topic created by the bus.
pub const TOPIC_REPLICATION: i32 = 1;

/// Live connections, present only while the bus is started.
struct KafkaConnections {
    producer: FutureProducer,
    admin: Arc<AdminClient<DefaultClientContext>>,
}

/// Kafka-backed event bus implementation.
pub struct KafkaEventBus {
    config: KafkaConfig,
    connections: RwLock<Option<KafkaConnections>>,
    topics: RwLock<HashSet<String>>,
    router: TopicRouter,
}

impl std::fmt::Debug for KafkaEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KafkaEventBus")
            .field("config", &self.config)
            .field("timeouts", self.router.timeouts())
            .finish()
    }
}

impl KafkaEventBus {
    /// Create a new Kafka event bus. No connection is made until `start`.
    pub fn new(config: KafkaConfig, timeouts: Timeouts) -> Self {
        Self {
            config,
            connections: RwLock::new(None),
            topics: RwLock::new(HashSet::new()),
            router: TopicRouter::new(NAME, timeouts),
        }
    }

    /// Producer client configuration.
    fn producer_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &self.config.bootstrap_servers)
            .set("client.id", &self.config.client_id)
            .set("acks", "all")
            .set("retries", "3")
            .set(
                "message.timeout.ms",
                self.router.timeouts().publish.as_millis().to_string(),
            );
        config
    }

    /// Admin client configuration.
    fn admin_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &self.config.bootstrap_servers)
            .set("client.id", format!("{}-admin", self.config.client_id));
        config
    }

    /// Per-topic consumer configuration.
    fn consumer_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &self.config.bootstrap_servers)
            .set("client.id", &self.config.client_id)
            .set("group.id", &self.config.group_id)
            .set("auto.offset.reset", "latest")
            .set("enable.auto.commit", "true");
        config
    }

    fn ensure_started(connections: &Option<KafkaConnections>) -> EventBusResult<&KafkaConnections> {
        connections
            .as_ref()
            .ok_or(EventBusError::NotStarted { backend: NAME })
    }

    /// Names of the topics that currently exist on the broker.
    async fn broker_topics(&self, producer: &FutureProducer) -> EventBusResult<HashSet<String>> {
        let producer = producer.clone();
        let timeout = self.router.timeouts().connect;

        let metadata = tokio::task::spawn_blocking(move || producer.client().fetch_metadata(None, timeout))
            .await
            .map_err(|e| EventBusError::ConnectionError(e.to_string()))?
            .map_err(|e| EventBusError::ConnectionError(e.to_string()))?;

        Ok(metadata
            .topics()
            .iter()
            .map(|topic| topic.name().to_string())
            .collect())
    }

    fn map_publish_error(&self, topic: &str, err: KafkaError) -> EventBusError {
        match err {
            KafkaError::MessageProduction(RDKafkaErrorCode::MessageTimedOut)
            | KafkaError::MessageProduction(RDKafkaErrorCode::QueueFull) => EventBusError::PublishTimeout {
                topic: topic.to_string(),
                timeout_ms: self.router.timeouts().publish.as_millis() as u64,
            },
            other => EventBusError::PublishError(other.to_string()),
        }
    }
}

/// Requested names not yet known, each listed once in request order.
fn unknown_topics<'a>(known: &HashSet<String>, requested: &'a [String]) -> Vec<&'a String> {
    let mut seen = HashSet::new();
    requested
        .iter()
        .filter(|topic| !known.contains(*topic) && seen.insert(*topic))
        .collect()
}

struct KafkaSource {
    consumer: StreamConsumer,
}

#[async_trait]
impl MessageSource for KafkaSource {
    async fn next_message(&mut self) -> EventBusResult<Option<Message>> {
        let record = self
            .consumer
            .recv()
            .await
            .map_err(|e| EventBusError::ConnectionError(e.to_string()))?;

        match record.payload_view::<str>() {
            Some(Ok(json)) => Message::from_json(json).map(Some),
            Some(Err(e)) => Err(EventBusError::SerializationError(e.to_string())),
            None => Err(EventBusError::SerializationError("empty record payload".to_string())),
        }
    }

    async fn close(&mut self) {
        self.consumer.unsubscribe();
    }
}

#[async_trait]
impl EventBus for KafkaEventBus {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn start(&self) -> EventBusResult<()> {
        let mut connections = self.connections.write().await;
        if connections.is_some() {
            debug!("Kafka event bus already started");
            return Ok(());
        }

        let producer: FutureProducer = self
            .producer_config()
            .create()
            .map_err(|e| EventBusError::ConnectionError(e.to_string()))?;
        let admin: AdminClient<DefaultClientContext> = self
            .admin_config()
            .create()
            .map_err(|e| EventBusError::ConnectionError(e.to_string()))?;

        // Client creation is lazy; fetching metadata proves the broker is reachable.
        self.broker_topics(&producer).await?;

        *connections = Some(KafkaConnections {
            producer,
            admin: Arc::new(admin),
        });

        info!(bootstrap_servers = %self.config.bootstrap_servers, "Kafka event bus started");
        Ok(())
    }

    async fn stop(&self) {
        let Some(live) = self.connections.write().await.take() else {
            return;
        };

        // Callbacks may still publish while consumers drain, so the lock is released first.
        self.router.shutdown().await;

        let producer = live.producer;
        let timeout = self.router.timeouts().join;
        match tokio::task::spawn_blocking(move || producer.flush(timeout)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Failed to flush Kafka producer"),
            Err(e) => warn!(error = %e, "Kafka producer flush task failed"),
        }
        drop(live.admin);

        info!("Kafka event bus stopped");
    }

    async fn is_started(&self) -> bool {
        self.connections.read().await.is_some()
    }

    async fn publish(&self, message: Message) -> EventBusResult<()> {
        let producer = {
            let connections = self.connections.read().await;
            Self::ensure_started(&connections)?.producer.clone()
        };

        let json = message.to_json()?;
        let topic = message.topic();
        let publish_timeout = self.router.timeouts().publish;
        let record = FutureRecord::<(), str>::to(topic).payload(json.as_str());

        // Bounded twice: librdkafka's message timeout and a local deadline.
        let delivery = tokio::time::timeout(
            publish_timeout + Duration::from_millis(500),
            producer.send(record, Timeout::After(publish_timeout)),
        )
        .await
        .map_err(|_| EventBusError::PublishTimeout {
            topic: topic.to_string(),
            timeout_ms: publish_timeout.as_millis() as u64,
        })?;

        match delivery {
            Ok((partition, offset)) => {
                self.router.counters().record_published();
                debug!(
                    topic = %topic,
                    message_id = %message.message_id(),
                    partition,
                    offset,
                    "Published event to Kafka"
                );
                Ok(())
            }
            Err((e, _)) => {
                warn!(topic = %topic, message_id = %message.message_id(), error = %e, "Kafka publish failed");
                Err(self.map_publish_error(topic, e))
            }
        }
    }

    async fn subscribe(&self, topic: &str, callback: Callback) -> EventBusResult<()> {
        if !self.is_started().await {
            return Err(EventBusError::NotStarted { backend: NAME });
        }
        self.create_topics(&[topic.to_string()]).await?;

        self.router
            .subscribe(topic, callback, || async {
                let consumer: StreamConsumer = self
                    .consumer_config()
                    .create()
                    .map_err(|e| EventBusError::SubscribeError(e.to_string()))?;
                consumer
                    .subscribe(&[topic])
                    .map_err(|e| EventBusError::SubscribeError(e.to_string()))?;
                Ok(KafkaSource { consumer })
            })
            .await
    }

    async fn unsubscribe(&self, topic: &str, callback: &Callback) {
        self.router.unsubscribe(topic, callback).await;
    }

    async fn create_topics(&self, topics: &[String]) -> EventBusResult<()> {
        let (producer, admin) = {
            let connections = self.connections.read().await;
            let live = Self::ensure_started(&connections)?;
            (live.producer.clone(), live.admin.clone())
        };

        let unknown = unknown_topics(&*self.topics.read().await, topics);
        if unknown.is_empty() {
            return Ok(());
        }

        let existing = self.broker_topics(&producer).await?;
        let missing: Vec<NewTopic<'_>> = unknown
            .iter()
            .filter(|t| !existing.contains(t.as_str()))
            .map(|t| NewTopic::new(t.as_str(), TOPIC_PARTITIONS, TopicReplication::Fixed(TOPIC_REPLICATION)))
            .collect();

        if missing.is_empty() {
            debug!(topics = ?unknown, "All requested topics already exist");
        } else {
            let options = AdminOptions::new().operation_timeout(Some(Timeout::After(self.router.timeouts().connect)));
            let results = admin
                .create_topics(missing.iter(), &options)
                .await
                .map_err(|e| EventBusError::TopicError(e.to_string()))?;

            for result in results {
                match result {
                    Ok(name) => info!(topic = %name, partitions = TOPIC_PARTITIONS, "Created Kafka topic"),
                    Err((name, RDKafkaErrorCode::TopicAlreadyExists)) => {
                        debug!(topic = %name, "Kafka topic created concurrently")
                    }
                    Err((name, code)) => {
                        return Err(EventBusError::TopicError(format!("{name}: {code}")));
                    }
                }
            }
        }

        self.topics
            .write()
            .await
            .extend(unknown.iter().map(|t| (*t).clone()));
        Ok(())
    }

    async fn stats(&self) -> EventBusStats {
        self.router.stats().await
    }
}

impl Drop for KafkaEventBus {
    fn drop(&mut self) {
        if self.connections.get_mut().is_some() {
            warn!("KafkaEventBus dropped while started");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bus() -> KafkaEventBus {
        KafkaEventBus::new(KafkaConfig::default(), Timeouts::default())
    }

    #[test]
    fn test_topic_layout_constants() {
        assert_eq!(TOPIC_PARTITIONS, 3);
        assert_eq!(TOPIC_REPLICATION, 1);
    }

    #[test]
    fn test_consumer_config_reads_latest_offsets() {
        let config = bus().consumer_config();
        assert_eq!(config.get("auto.offset.reset"), Some("latest"));
        assert_eq!(config.get("group.id"), Some("verseforge-consumer-group"));
        assert_eq!(config.get("enable.auto.commit"), Some("true"));
    }

    #[test]
    fn test_producer_config_waits_for_all_replicas() {
        let config = bus().producer_config();
        assert_eq!(config.get("acks"), Some("all"));
        assert_eq!(config.get("message.timeout.ms"), Some("10000"));
        assert_eq!(config.get("client.id"), Some("verseforge-client"));
    }

    #[test]
    fn test_admin_client_id_is_suffixed() {
        assert_eq!(bus().admin_config().get("client.id"), Some("verseforge-client-admin"));
    }

    #[test]
    fn test_timeout_errors_map_to_publish_timeout() {
        let err = bus().map_publish_error("t", KafkaError::MessageProduction(RDKafkaErrorCode::MessageTimedOut));
        assert!(matches!(err, EventBusError::PublishTimeout { timeout_ms: 10_000, .. }));

        let err = bus().map_publish_error("t", KafkaError::MessageProduction(RDKafkaErrorCode::MessageSizeTooLarge));
        assert!(matches!(err, EventBusError::PublishError(_)));
    }

    #[tokio::test]
    async fn test_operations_require_start() {
        let bus = bus();
        assert!(!bus.is_started().await);
        assert!(matches!(
            bus.publish(Message::new("t", serde_json::json!(1))).await,
            Err(EventBusError::NotStarted { backend: "kafka" })
        ));
        assert!(bus.create_topics(&["t".to_string()]).await.is_err());
        assert!(bus.subscribe("t", Callback::from_fn(|_| Ok(()))).await.is_err());
        bus.stop().await;
    }

    #[test]
    fn test_unknown_topics_are_deduplicated() {
        let known = HashSet::from(["plot_events".to_string()]);
        let requested = vec![
            "scene_events".to_string(),
            "plot_events".to_string(),
            "scene_events".to_string(),
            "qa_events".to_string(),
        ];

        let unknown = unknown_topics(&known, &requested);
        assert_eq!(unknown, vec!["scene_events", "qa_events"]);
    }
}
