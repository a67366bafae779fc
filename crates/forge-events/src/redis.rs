//! Redis-backed event bus.
//!
//! Topics map one-to-one onto Redis pub/sub channels. Redis keeps no
//! history, so a message published while a topic has no subscribed consumer
//! anywhere is lost; the broker reports zero receivers and the bus logs it.
//! Topic creation is local bookkeeping only, channels exist implicitly.

use crate::bus::{EventBus, EventBusStats};
use crate::config::{RedisConfig, Timeouts};
use crate::error::{EventBusError, EventBusResult};
use crate::handler::Callback;
use crate::message::Message;
use crate::router::{MessageSource, TopicRouter};
use async_trait::async_trait;
use futures::stream::{Stream, StreamExt};
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client, ConnectionAddr, ConnectionInfo, Msg, RedisConnectionInfo};
use std::collections::HashSet;
use std::pin::Pin;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const NAME: &str = "redis";

/// Live connections, present only while the bus is started.
struct RedisConnections {
    client: Client,
    publisher: MultiplexedConnection,
}

/// Redis pub/sub backed event bus.
pub struct RedisEventBus {
    config: RedisConfig,
    connections: RwLock<Option<RedisConnections>>,
    topics: RwLock<HashSet<String>>,
    router: TopicRouter,
}

impl std::fmt::Debug for RedisEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisEventBus")
            .field("config", &self.config)
            .field("timeouts", self.router.timeouts())
            .finish()
    }
}

impl RedisEventBus {
    /// Create a new Redis event bus. No connection is made until `start`.
    pub fn new(config: RedisConfig, timeouts: Timeouts) -> Self {
        Self {
            config,
            connections: RwLock::new(None),
            topics: RwLock::new(HashSet::new()),
            router: TopicRouter::new(NAME, timeouts),
        }
    }

    /// Topics registered through `create_topics` or `subscribe`.
    pub async fn topics(&self) -> HashSet<String> {
        self.topics.read().await.clone()
    }

    /// Connection parameters. The password is passed as-is, never through a URL.
    fn connection_info(&self) -> ConnectionInfo {
        ConnectionInfo {
            addr: ConnectionAddr::Tcp(self.config.host.clone(), self.config.port),
            redis: RedisConnectionInfo {
                db: self.config.db,
                password: self.config.password.clone(),
                ..RedisConnectionInfo::default()
            },
        }
    }

    async fn connect(&self) -> EventBusResult<RedisConnections> {
        let client = Client::open(self.connection_info()).map_err(|e| EventBusError::ConnectionError(e.to_string()))?;

        let mut publisher = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| EventBusError::ConnectionError(e.to_string()))?;

        redis::cmd("PING")
            .query_async::<_, String>(&mut publisher)
            .await
            .map_err(|e| EventBusError::ConnectionError(e.to_string()))?;

        Ok(RedisConnections { client, publisher })
    }

    async fn client(&self) -> EventBusResult<Client> {
        self.connections
            .read()
            .await
            .as_ref()
            .map(|live| live.client.clone())
            .ok_or(EventBusError::NotStarted { backend: NAME })
    }
}

struct RedisSource {
    messages: Pin<Box<dyn Stream<Item = Msg> + Send>>,
}

#[async_trait]
impl MessageSource for RedisSource {
    async fn next_message(&mut self) -> EventBusResult<Option<Message>> {
        let Some(msg) = self.messages.next().await else {
            return Ok(None);
        };

        let json: String = msg
            .get_payload()
            .map_err(|e| EventBusError::SerializationError(e.to_string()))?;
        Message::from_json(&json).map(Some)
    }
}

#[async_trait]
impl EventBus for RedisEventBus {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn start(&self) -> EventBusResult<()> {
        let mut connections = self.connections.write().await;
        if connections.is_some() {
            debug!("Redis event bus already started");
            return Ok(());
        }

        let connect_timeout = self.router.timeouts().connect;
        let live = tokio::time::timeout(connect_timeout, self.connect())
            .await
            .map_err(|_| {
                EventBusError::ConnectionError(format!(
                    "timed out after {}ms connecting to {}:{}",
                    connect_timeout.as_millis(),
                    self.config.host,
                    self.config.port
                ))
            })??;

        *connections = Some(live);
        info!(host = %self.config.host, port = self.config.port, db = self.config.db, "Redis event bus started");
        Ok(())
    }

    async fn stop(&self) {
        let Some(live) = self.connections.write().await.take() else {
            return;
        };

        self.router.shutdown().await;
        drop(live);

        info!("Redis event bus stopped");
    }

    async fn is_started(&self) -> bool {
        self.connections.read().await.is_some()
    }

    async fn publish(&self, message: Message) -> EventBusResult<()> {
        let mut publisher = {
            let connections = self.connections.read().await;
            connections
                .as_ref()
                .map(|live| live.publisher.clone())
                .ok_or(EventBusError::NotStarted { backend: NAME })?
        };

        let json = message.to_json()?;
        let topic = message.topic();
        let publish_timeout = self.router.timeouts().publish;

        let receivers: i64 = tokio::time::timeout(publish_timeout, publisher.publish(topic, json))
            .await
            .map_err(|_| EventBusError::PublishTimeout {
                topic: topic.to_string(),
                timeout_ms: publish_timeout.as_millis() as u64,
            })?
            .map_err(|e| EventBusError::PublishError(e.to_string()))?;

        self.router.counters().record_published();
        if receivers == 0 {
            debug!(topic = %topic, message_id = %message.message_id(), "No Redis subscribers, message lost");
        } else {
            debug!(topic = %topic, message_id = %message.message_id(), receivers, "Published event to Redis");
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str, callback: Callback) -> EventBusResult<()> {
        let client = self.client().await?;
        self.create_topics(&[topic.to_string()]).await?;

        self.router
            .subscribe(topic, callback, || async move {
                let mut pubsub = client
                    .get_async_connection()
                    .await
                    .map_err(|e| EventBusError::SubscribeError(e.to_string()))?
                    .into_pubsub();
                pubsub
                    .subscribe(topic)
                    .await
                    .map_err(|e| EventBusError::SubscribeError(e.to_string()))?;

                Ok(RedisSource {
                    messages: Box::pin(pubsub.into_on_message()),
                })
            })
            .await
    }

    async fn unsubscribe(&self, topic: &str, callback: &Callback) {
        self.router.unsubscribe(topic, callback).await;
    }

    async fn create_topics(&self, topics: &[String]) -> EventBusResult<()> {
        if !self.is_started().await {
            return Err(EventBusError::NotStarted { backend: NAME });
        }

        let mut known = self.topics.write().await;
        for topic in topics {
            if known.insert(topic.clone()) {
                debug!(topic = %topic, "Registered Redis channel");
            }
        }
        Ok(())
    }

    async fn stats(&self) -> EventBusStats {
        self.router.stats().await
    }
}

impl Drop for RedisEventBus {
    fn drop(&mut self) {
        if self.connections.get_mut().is_some() {
            warn!("RedisEventBus dropped while started");
        }
    }
}
