//! # Forge Events
//!
//! Topic-based publish/subscribe messaging with interchangeable transports.
//!
//! ## Overview
//!
//! The forge-events crate handles:
//! - **Message Envelope**: [`Message`], a JSON payload tagged with topic, id and timestamp
//! - **Event Bus**: the [`EventBus`] contract every transport implements
//! - **Backends**: in-process, Kafka and Redis pub/sub transports
//! - **Client**: [`EventBusClient`], whose subscriptions survive reconnects
//! - **Server**: [`EventBusServer`], a standalone process owning one bus
//!
//! ## Features
//!
//! - Memory backend (always available): single-process delivery over in-process channels
//! - `kafka`: Kafka-backed event bus
//! - `redis`: Redis pub/sub event bus
//! - `full`: both broker backends
//!
//! ## Usage
//!
//! ### Publishing and subscribing
//!
//! ```rust,no_run
//! use forge_events::{Callback, EventBus, MemoryEventBus, Message};
//! use serde_json::json;
//!
//! async fn example() -> forge_events::EventBusResult<()> {
//!     let bus = MemoryEventBus::new();
//!     bus.start().await?;
//!
//!     bus.subscribe("character_events", Callback::from_fn(|message| {
//!         println!("{}: {}", message.topic(), message.payload());
//!         Ok(())
//!     }))
//!     .await?;
//!
//!     bus.publish(Message::new("character_events", json!({"name": "Ada"}))).await?;
//!     bus.stop().await;
//!     Ok(())
//! }
//! ```
//!
//! ### Choosing a backend from the environment
//!
//! ```rust,no_run
//! use forge_events::{build_bus, BusConfig, EventBus};
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     // EVENT_BUS_IMPLEMENTATION=kafka|redis|memory
//!     let bus = build_bus(&BusConfig::from_env()?)?;
//!     bus.start().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Delivery
//!
//! Each subscribed topic has one consumer task. Callbacks of a topic are
//! invoked one after another for every message; a failing or panicking
//! callback is logged and does not affect the others. Memory and Redis
//! deliver in publish order. Kafka topics have several partitions and give
//! no ordering guarantee across them.

pub mod bus;
pub mod client;
pub mod config;
pub mod error;
pub mod factory;
pub mod handler;
pub mod health;
pub mod memory;
pub mod message;
pub mod registry;
mod router;
pub mod server;

#[cfg(feature = "kafka")]
pub mod kafka;

#[cfg(feature = "redis")]
pub mod redis;

// Re-export main types
pub use bus::{EventBus, EventBusStats};
pub use client::{EventBusClient, HEALTH_CHECK_TOPIC};
pub use config::{BusConfig, BusKind, KafkaConfig, RedisConfig, Timeouts};
pub use error::{CallbackError, ConfigError, EventBusError, EventBusResult};
pub use factory::{build_bus, Backend};
pub use handler::{Callback, EventHandler};
pub use health::{HealthReport, HealthStatus};
pub use memory::MemoryEventBus;
pub use message::Message;
pub use registry::SubscriptionRegistry;
pub use server::{EventBusServer, WELL_KNOWN_TOPICS};

#[cfg(feature = "kafka")]
pub use self::kafka::KafkaEventBus;

#[cfg(feature = "redis")]
pub use self::redis::RedisEventBus;
