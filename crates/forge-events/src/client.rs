//! Application-facing event bus client.
//!
//! [`EventBusClient`] owns one connect/disconnect lifecycle, meant to be tied
//! to the hosting application's startup and shutdown. It keeps its own
//! subscription registry so that subscriptions survive a reconnect: every
//! `connect` builds a fresh backend, starts it and replays the registry into
//! it.

use crate::bus::EventBus;
use crate::config::BusConfig;
use crate::error::{ConfigError, EventBusResult};
use crate::factory::{build_bus, Backend};
use crate::handler::Callback;
use crate::health::HealthReport;
use crate::message::Message;
use crate::registry::{Registration, SubscriptionRegistry};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Topic probed by [`EventBusClient::health_check`].
pub const HEALTH_CHECK_TOPIC: &str = "_health_check";

type BusFactory<B> = Box<dyn Fn() -> EventBusResult<B> + Send + Sync>;

/// Event bus client with reconnect-transparent subscriptions.
///
/// # Example
///
/// ```rust,no_run
/// use forge_events::{BusConfig, Callback, EventBusClient};
///
/// async fn example() -> Result<(), Box<dyn std::error::Error>> {
///     let client = EventBusClient::new(BusConfig::from_env()?);
///     client.connect().await?;
///
///     client
///         .subscribe("plot_events", Callback::from_fn(|message| {
///             println!("{}", message.payload());
///             Ok(())
///         }))
///         .await?;
///     client.publish("plot_events", &serde_json::json!({"chapter": 3})).await?;
///
///     client.disconnect().await;
///     Ok(())
/// }
/// ```
pub struct EventBusClient<B: EventBus = Backend> {
    factory: BusFactory<B>,
    bus: RwLock<Option<Arc<B>>>,
    registry: SubscriptionRegistry,
}

impl EventBusClient<Backend> {
    /// Client building its backend from `config` on every connect.
    pub fn new(config: BusConfig) -> Self {
        Self::with_factory(move || build_bus(&config))
    }

    /// Client configured from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self::new(BusConfig::from_env()?))
    }
}

impl<B: EventBus + 'static> EventBusClient<B> {
    /// Client using `factory` to construct a fresh backend on every connect.
    pub fn with_factory<F>(factory: F) -> Self
    where
        F: Fn() -> EventBusResult<B> + Send + Sync + 'static,
    {
        Self {
            factory: Box::new(factory),
            bus: RwLock::new(None),
            registry: SubscriptionRegistry::new(),
        }
    }

    /// Build and start the backend, then replay every registered
    /// subscription into it. A no-op when already connected.
    ///
    /// If the replay fails the new backend is stopped and the error returned;
    /// the registry is left untouched.
    pub async fn connect(&self) -> EventBusResult<Arc<B>> {
        let mut slot = self.bus.write().await;
        if let Some(bus) = slot.as_ref() {
            return Ok(bus.clone());
        }

        let bus = Arc::new((self.factory)()?);
        bus.start().await?;

        let entries = self.registry.entries().await;
        for (topic, callback) in &entries {
            if let Err(e) = bus.subscribe(topic, callback.clone()).await {
                warn!(topic = %topic, error = %e, "Failed to restore subscription");
                bus.stop().await;
                return Err(e);
            }
        }

        *slot = Some(bus.clone());
        info!(
            implementation = bus.name(),
            restored_subscriptions = entries.len(),
            "Event bus client connected"
        );
        Ok(bus)
    }

    /// Unsubscribe every registered pair from the backend, stop it and drop
    /// it. The registry is kept for the next [`connect`](Self::connect).
    pub async fn disconnect(&self) {
        let Some(bus) = self.bus.write().await.take() else {
            debug!("Event bus client already disconnected");
            return;
        };

        for (topic, callback) in self.registry.entries().await {
            bus.unsubscribe(&topic, &callback).await;
        }
        bus.stop().await;

        info!(implementation = bus.name(), "Event bus client disconnected");
    }

    /// Whether a backend is currently connected.
    pub async fn is_connected(&self) -> bool {
        self.bus.read().await.is_some()
    }

    /// The live backend, if connected.
    pub async fn bus(&self) -> Option<Arc<B>> {
        self.bus.read().await.clone()
    }

    /// Every (topic, callback) pair held by the client.
    pub async fn subscriptions(&self) -> Vec<(String, Callback)> {
        self.registry.entries().await
    }

    /// Publish `payload` to `topic`, connecting first if needed.
    pub async fn publish<T: Serialize>(&self, topic: &str, payload: &T) -> EventBusResult<()> {
        let message = Message::from_payload(topic, payload)?;
        self.publish_message(message).await
    }

    /// Publish a prepared message, connecting first if needed.
    pub async fn publish_message(&self, message: Message) -> EventBusResult<()> {
        let bus = self.connect().await?;
        bus.publish(message).await
    }

    /// Register `callback` for `topic`, connecting first if needed.
    ///
    /// On failure a newly added registration is rolled back.
    pub async fn subscribe(&self, topic: &str, callback: Callback) -> EventBusResult<()> {
        let registration = self.registry.add(topic, callback.clone()).await;

        let subscribed = match self.connect().await {
            Ok(bus) => bus.subscribe(topic, callback.clone()).await,
            Err(e) => Err(e),
        };

        if let Err(e) = subscribed {
            if registration != Registration::AlreadyPresent {
                self.registry.remove(topic, &callback).await;
            }
            return Err(e);
        }
        Ok(())
    }

    /// Remove `callback` from `topic` in the registry and, when connected,
    /// from the backend.
    pub async fn unsubscribe(&self, topic: &str, callback: &Callback) {
        self.registry.remove(topic, callback).await;

        if let Some(bus) = self.bus().await {
            bus.unsubscribe(topic, callback).await;
        }
    }

    /// Probe the connected backend by creating [`HEALTH_CHECK_TOPIC`].
    pub async fn health_check(&self) -> HealthReport {
        let Some(bus) = self.bus().await else {
            return HealthReport::disconnected();
        };

        match bus.create_topics(&[HEALTH_CHECK_TOPIC.to_string()]).await {
            Ok(()) => HealthReport::connected(bus.name()),
            Err(e) => {
                warn!(implementation = bus.name(), error = %e, "Event bus health check failed");
                HealthReport::error(bus.name(), e)
            }
        }
    }
}

impl<B: EventBus> std::fmt::Debug for EventBusClient<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBusClient")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}
