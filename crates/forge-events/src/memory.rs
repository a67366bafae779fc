//! In-memory event bus.
//!
//! Reference backend with no network dependency. Bookkeeping happens on the
//! caller, delivery happens on a per-topic dispatcher task fed through an
//! unbounded channel, so `publish` never waits on subscribers and each
//! subscriber sees messages in publish order.

use crate::bus::{EventBus, EventBusStats};
use crate::config::Timeouts;
use crate::error::{EventBusError, EventBusResult};
use crate::handler::Callback;
use crate::message::Message;
use crate::router::{MessageSource, TopicRouter};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};

const NAME: &str = "memory";

/// In-memory event bus implementation.
///
/// Suitable for single-process deployments and tests. Publishing to a topic
/// that was never created, or that has no subscribers, is logged and the
/// message dropped.
pub struct MemoryEventBus {
    started: AtomicBool,
    topics: RwLock<HashSet<String>>,
    senders: Mutex<HashMap<String, mpsc::UnboundedSender<Message>>>,
    router: TopicRouter,
}

impl std::fmt::Debug for MemoryEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryEventBus")
            .field("started", &self.started.load(Ordering::Relaxed))
            .field("timeouts", self.router.timeouts())
            .finish()
    }
}

impl MemoryEventBus {
    /// Create a new in-memory event bus.
    pub fn new() -> Self {
        Self::with_timeouts(Timeouts::default())
    }

    /// Create with custom poll and join timeouts.
    pub fn with_timeouts(timeouts: Timeouts) -> Self {
        Self {
            started: AtomicBool::new(false),
            topics: RwLock::new(HashSet::new()),
            senders: Mutex::new(HashMap::new()),
            router: TopicRouter::new(NAME, timeouts),
        }
    }

    /// Topics created so far.
    pub async fn topics(&self) -> HashSet<String> {
        self.topics.read().await.clone()
    }

    fn ensure_started(&self) -> EventBusResult<()> {
        if self.started.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(EventBusError::NotStarted { backend: NAME })
        }
    }
}

impl Default for MemoryEventBus {
    fn default() -> Self {
        Self::new()
    }
}

struct MemorySource {
    rx: mpsc::UnboundedReceiver<Message>,
}

#[async_trait]
impl MessageSource for MemorySource {
    async fn next_message(&mut self) -> EventBusResult<Option<Message>> {
        Ok(self.rx.recv().await)
    }

    async fn close(&mut self) {
        self.rx.close();
    }
}

#[async_trait]
impl EventBus for MemoryEventBus {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn start(&self) -> EventBusResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            debug!("Memory event bus already started");
            return Ok(());
        }

        info!("Memory event bus started");
        Ok(())
    }

    async fn stop(&self) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }

        self.router.shutdown().await;
        self.senders.lock().await.clear();
        info!("Memory event bus stopped");
    }

    async fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    async fn publish(&self, message: Message) -> EventBusResult<()> {
        self.ensure_started()?;

        let topic = message.topic().to_string();
        if !self.topics.read().await.contains(&topic) {
            self.router.counters().record_dropped();
            warn!(topic = %topic, "Publish to a topic that was never created, ignoring");
            return Ok(());
        }

        let sender = self
            .senders
            .lock()
            .await
            .get(&topic)
            .filter(|tx| !tx.is_closed())
            .cloned();

        let Some(sender) = sender else {
            self.router.counters().record_dropped();
            debug!(topic = %topic, message_id = %message.message_id(), "Topic has no subscribers, message dropped");
            return Ok(());
        };

        let message_id = message.message_id().to_string();
        if sender.send(message).is_err() {
            self.router.counters().record_dropped();
            debug!(topic = %topic, message_id = %message_id, "Dispatcher gone, message dropped");
            return Ok(());
        }

        self.router.counters().record_published();
        debug!(topic = %topic, message_id = %message_id, "Published event");
        Ok(())
    }

    async fn subscribe(&self, topic: &str, callback: Callback) -> EventBusResult<()> {
        self.ensure_started()?;
        self.create_topics(&[topic.to_string()]).await?;

        self.router
            .subscribe(topic, callback, || async {
                let (tx, rx) = mpsc::unbounded_channel();
                self.senders.lock().await.insert(topic.to_string(), tx);
                Ok(MemorySource { rx })
            })
            .await
    }

    async fn unsubscribe(&self, topic: &str, callback: &Callback) {
        self.router
            .unsubscribe_with(topic, callback, || async {
                self.senders.lock().await.remove(topic);
            })
            .await;
    }

    async fn create_topics(&self, topics: &[String]) -> EventBusResult<()> {
        self.ensure_started()?;

        let mut known = self.topics.write().await;
        let created: Vec<&String> = topics.iter().filter(|t| known.insert((*t).clone())).collect();
        if !created.is_empty() {
            info!(topics = ?created, "Created topics");
        }

        Ok(())
    }

    async fn stats(&self) -> EventBusStats {
        self.router.stats().await
    }
}

impl Drop for MemoryEventBus {
    fn drop(&mut self) {
        if *self.started.get_mut() {
            warn!("MemoryEventBus dropped while started");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CallbackError;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    fn recorder() -> (Callback, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let callback = Callback::from_fn(move |message| {
            let _ = tx.send(message);
            Ok(())
        });
        (callback, rx)
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<Message>) -> Option<Message> {
        tokio::time::timeout(Duration::from_millis(100), rx.recv())
            .await
            .ok()
            .flatten()
    }

    async fn started_bus() -> MemoryEventBus {
        let bus = MemoryEventBus::new();
        bus.start().await.unwrap();
        bus
    }

    #[tokio::test]
    async fn test_end_to_end_delivery() {
        let bus = started_bus().await;
        bus.create_topics(&["t1".to_string()]).await.unwrap();

        let (callback, mut rx) = recorder();
        bus.subscribe("t1", callback).await.unwrap();
        bus.publish(Message::new("t1", json!("hello"))).await.unwrap();

        let received = next(&mut rx).await.expect("callback not invoked");
        assert_eq!(received.payload(), &json!("hello"));
        assert!(next(&mut rx).await.is_none(), "callback invoked more than once");
        bus.stop().await;
    }

    #[tokio::test]
    async fn test_operations_require_start() {
        let bus = MemoryEventBus::new();

        let err = bus.publish(Message::new("t", json!(1))).await.unwrap_err();
        assert!(matches!(err, EventBusError::NotStarted { backend: "memory" }));
        assert!(bus.subscribe("t", Callback::from_fn(|_| Ok(()))).await.is_err());
        assert!(bus.create_topics(&["t".to_string()]).await.is_err());

        bus.unsubscribe("t", &Callback::from_fn(|_| Ok(()))).await;
    }

    #[tokio::test]
    async fn test_start_and_stop_are_idempotent() {
        let bus = MemoryEventBus::new();
        bus.start().await.unwrap();
        bus.start().await.unwrap();
        assert!(bus.is_started().await);

        bus.stop().await;
        bus.stop().await;
        assert!(!bus.is_started().await);
    }

    #[tokio::test]
    async fn test_idempotent_subscribe() {
        let bus = started_bus().await;
        let (callback, mut rx) = recorder();

        bus.subscribe("t", callback.clone()).await.unwrap();
        bus.subscribe("t", callback).await.unwrap();
        bus.publish(Message::new("t", json!(1))).await.unwrap();

        assert!(next(&mut rx).await.is_some());
        assert!(next(&mut rx).await.is_none());
        assert_eq!(bus.stats().await.active_subscriptions, 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_unknown_callback_is_noop() {
        let bus = started_bus().await;
        let (callback, mut rx) = recorder();
        bus.subscribe("t", callback).await.unwrap();

        bus.unsubscribe("t", &Callback::from_fn(|_| Ok(()))).await;
        bus.unsubscribe("never-subscribed", &Callback::from_fn(|_| Ok(()))).await;

        bus.publish(Message::new("t", json!("still here"))).await.unwrap();
        assert_eq!(next(&mut rx).await.unwrap().payload(), &json!("still here"));
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_dropped() {
        let bus = started_bus().await;
        bus.create_topics(&["quiet".to_string()]).await.unwrap();

        bus.publish(Message::new("quiet", json!(1))).await.unwrap();

        let stats = bus.stats().await;
        assert_eq!(stats.events_published, 0);
        assert_eq!(stats.dropped_messages, 1);
    }

    #[tokio::test]
    async fn test_publish_to_unknown_topic_is_ignored() {
        let bus = started_bus().await;
        bus.publish(Message::new("unknown", json!(1))).await.unwrap();
        assert_eq!(bus.stats().await.dropped_messages, 1);
    }

    #[tokio::test]
    async fn test_subscribe_creates_topic() {
        let bus = started_bus().await;
        bus.subscribe("auto", Callback::from_fn(|_| Ok(()))).await.unwrap();
        assert!(bus.topics().await.contains("auto"));
    }

    #[tokio::test]
    async fn test_failure_isolation() {
        let bus = started_bus().await;
        let failing = Callback::from_fn(|_| Err(CallbackError::new("always fails")));
        let (callback, mut rx) = recorder();

        bus.subscribe("t", failing).await.unwrap();
        bus.subscribe("t", callback).await.unwrap();

        bus.publish(Message::new("t", json!(1))).await.unwrap();
        assert_eq!(next(&mut rx).await.unwrap().payload(), &json!(1));
        assert!(next(&mut rx).await.is_none());

        bus.publish(Message::new("t", json!(2))).await.unwrap();
        assert_eq!(next(&mut rx).await.unwrap().payload(), &json!(2));
    }

    #[tokio::test]
    async fn test_publish_returns_before_slow_callback_finishes() {
        let bus = started_bus().await;
        let slow = Callback::from_async(|_message: Message| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        });
        bus.subscribe("t", slow).await.unwrap();

        tokio::time::timeout(Duration::from_millis(100), bus.publish(Message::new("t", json!(1))))
            .await
            .expect("publish blocked on subscriber")
            .unwrap();
    }

    #[tokio::test]
    async fn test_delivery_preserves_publish_order() {
        let bus = started_bus().await;
        let (callback, mut rx) = recorder();
        bus.subscribe("ordered", callback).await.unwrap();

        for i in 0..50 {
            bus.publish(Message::new("ordered", json!(i))).await.unwrap();
        }

        for i in 0..50 {
            assert_eq!(next(&mut rx).await.unwrap().payload(), &json!(i));
        }
    }

    #[tokio::test]
    async fn test_last_unsubscribe_stops_delivery() {
        let bus = started_bus().await;
        let (callback, mut rx) = recorder();
        bus.subscribe("t", callback.clone()).await.unwrap();
        assert_eq!(bus.stats().await.active_consumers, 1);

        bus.unsubscribe("t", &callback).await;
        assert_eq!(bus.stats().await.active_consumers, 0);

        bus.publish(Message::new("t", json!(1))).await.unwrap();
        assert!(next(&mut rx).await.is_none());

        let (again, mut rx_again) = recorder();
        bus.subscribe("t", again).await.unwrap();
        bus.publish(Message::new("t", json!(2))).await.unwrap();
        assert_eq!(next(&mut rx_again).await.unwrap().payload(), &json!(2));
    }

    #[tokio::test]
    async fn test_restart_begins_with_empty_registry() {
        let bus = started_bus().await;
        let (callback, mut rx) = recorder();
        bus.subscribe("t", callback).await.unwrap();

        bus.stop().await;
        bus.start().await.unwrap();

        let stats = bus.stats().await;
        assert_eq!(stats.active_subscriptions, 0);
        assert_eq!(stats.active_consumers, 0);

        bus.publish(Message::new("t", json!(1))).await.unwrap();
        assert!(next(&mut rx).await.is_none());
        assert!(bus.topics().await.contains("t"));
    }

    #[tokio::test]
    async fn test_last_unsubscribe_releases_topic_channel() {
        let bus = started_bus().await;
        let (first, _rx1) = recorder();
        let (second, _rx2) = recorder();
        bus.subscribe("t", first.clone()).await.unwrap();
        bus.subscribe("t", second.clone()).await.unwrap();

        bus.unsubscribe("t", &first).await;
        assert!(bus.senders.lock().await.contains_key("t"));

        bus.unsubscribe("t", &second).await;
        assert!(!bus.senders.lock().await.contains_key("t"));
    }

    #[tokio::test]
    async fn test_callback_unsubscribing_itself_returns_promptly() {
        let bus = Arc::new(started_bus().await);
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        let own: Arc<std::sync::Mutex<Option<Callback>>> = Arc::new(std::sync::Mutex::new(None));

        let bus_ref = bus.clone();
        let own_ref = own.clone();
        let callback = Callback::from_async(move |_message: Message| {
            let bus = bus_ref.clone();
            let me = own_ref.lock().unwrap().take();
            let done_tx = done_tx.clone();
            async move {
                if let Some(me) = me {
                    let begun = std::time::Instant::now();
                    bus.unsubscribe("t", &me).await;
                    let _ = done_tx.send(begun.elapsed());
                }
                Ok(())
            }
        });
        *own.lock().unwrap() = Some(callback.clone());

        bus.subscribe("t", callback).await.unwrap();
        bus.publish(Message::new("t", json!("bye"))).await.unwrap();

        let elapsed = tokio::time::timeout(Duration::from_secs(2), done_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(elapsed < Duration::from_secs(1), "unsubscribe took {elapsed:?}");

        let stats = bus.stats().await;
        assert_eq!(stats.active_consumers, 0);
        assert_eq!(stats.active_subscriptions, 0);
        bus.stop().await;
    }
}
