//! Backend selection.
//!
//! [`build_bus`] maps a [`BusConfig`] onto one concrete backend wrapped in
//! [`Backend`]. Kafka and Redis are only available when the crate is built
//! with the matching feature; asking for one that was compiled out fails
//! with [`EventBusError::BackendUnavailable`](crate::EventBusError::BackendUnavailable).

use crate::bus::{EventBus, EventBusStats};
use crate::config::{BusConfig, BusKind};
use crate::error::EventBusResult;
#[cfg(not(all(feature = "kafka", feature = "redis")))]
use crate::error::EventBusError;
use crate::handler::Callback;
use crate::memory::MemoryEventBus;
use crate::message::Message;
use async_trait::async_trait;
use tracing::info;

#[cfg(feature = "kafka")]
use crate::kafka::KafkaEventBus;
#[cfg(feature = "redis")]
use crate::redis::RedisEventBus;

/// A constructed, not yet started event bus of the configured kind.
#[derive(Debug)]
pub enum Backend {
    /// In-process bus.
    Memory(MemoryEventBus),
    /// Kafka bus.
    #[cfg(feature = "kafka")]
    Kafka(KafkaEventBus),
    /// Redis pub/sub bus.
    #[cfg(feature = "redis")]
    Redis(RedisEventBus),
}

impl Backend {
    /// Kind of the wrapped backend.
    pub fn kind(&self) -> BusKind {
        match self {
            Backend::Memory(_) => BusKind::Memory,
            #[cfg(feature = "kafka")]
            Backend::Kafka(_) => BusKind::Kafka,
            #[cfg(feature = "redis")]
            Backend::Redis(_) => BusKind::Redis,
        }
    }
}

/// Construct the backend selected by `config.implementation`.
///
/// The returned bus is not started.
pub fn build_bus(config: &BusConfig) -> EventBusResult<Backend> {
    let backend = match config.implementation {
        BusKind::Memory => Backend::Memory(MemoryEventBus::with_timeouts(config.timeouts)),

        #[cfg(feature = "kafka")]
        BusKind::Kafka => Backend::Kafka(KafkaEventBus::new(config.kafka.clone(), config.timeouts)),
        #[cfg(not(feature = "kafka"))]
        BusKind::Kafka => return Err(EventBusError::BackendUnavailable("kafka")),

        #[cfg(feature = "redis")]
        BusKind::Redis => Backend::Redis(RedisEventBus::new(config.redis.clone(), config.timeouts)),
        #[cfg(not(feature = "redis"))]
        BusKind::Redis => return Err(EventBusError::BackendUnavailable("redis")),
    };

    info!(implementation = %config.implementation, "Event bus constructed");
    Ok(backend)
}

/// Forward a call to whichever backend is wrapped.
macro_rules! delegate {
    ($self:ident, $bus:ident => $call:expr) => {
        match $self {
            Backend::Memory($bus) => $call,
            #[cfg(feature = "kafka")]
            Backend::Kafka($bus) => $call,
            #[cfg(feature = "redis")]
            Backend::Redis($bus) => $call,
        }
    };
}

#[async_trait]
impl EventBus for Backend {
    fn name(&self) -> &'static str {
        delegate!(self, bus => bus.name())
    }

    async fn start(&self) -> EventBusResult<()> {
        delegate!(self, bus => bus.start().await)
    }

    async fn stop(&self) {
        delegate!(self, bus => bus.stop().await)
    }

    async fn is_started(&self) -> bool {
        delegate!(self, bus => bus.is_started().await)
    }

    async fn publish(&self, message: Message) -> EventBusResult<()> {
        delegate!(self, bus => bus.publish(message).await)
    }

    async fn subscribe(&self, topic: &str, callback: Callback) -> EventBusResult<()> {
        delegate!(self, bus => bus.subscribe(topic, callback).await)
    }

    async fn unsubscribe(&self, topic: &str, callback: &Callback) {
        delegate!(self, bus => bus.unsubscribe(topic, callback).await)
    }

    async fn create_topics(&self, topics: &[String]) -> EventBusResult<()> {
        delegate!(self, bus => bus.create_topics(topics).await)
    }

    async fn stats(&self) -> EventBusStats {
        delegate!(self, bus => bus.stats().await)
    }
}
