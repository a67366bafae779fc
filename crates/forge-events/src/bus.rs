//! Event bus contract
//!
//! This module defines the capability contract every transport implements
//! and the statistics each backend keeps.

use crate::error::EventBusResult;
use crate::handler::Callback;
use crate::message::Message;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};

/// Event bus trait for publish/subscribe operations.
///
/// Every backend honours the same lifecycle: `start` and `stop` are
/// idempotent, everything else except `unsubscribe` fails with
/// [`EventBusError::NotStarted`](crate::EventBusError::NotStarted) before
/// `start`, and `stop` always completes.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Backend name (`memory`, `kafka`, `redis`).
    fn name(&self) -> &'static str;

    /// Establish backend connections. Calling it again is a no-op.
    async fn start(&self) -> EventBusResult<()>;

    /// Cancel consumer tasks, join them with a bounded timeout and release
    /// connections. Teardown failures are logged, never returned.
    async fn stop(&self);

    /// Whether `start` has completed and `stop` has not been called since.
    async fn is_started(&self) -> bool;

    /// Publish a message to its topic.
    async fn publish(&self, message: Message) -> EventBusResult<()>;

    /// Register `callback` for `topic`, creating the topic if needed.
    ///
    /// Subscribing the same callback twice has no additional effect. The
    /// first subscriber of a topic starts that topic's consumer task.
    async fn subscribe(&self, topic: &str, callback: Callback) -> EventBusResult<()>;

    /// Remove `callback` from `topic`. Unknown callbacks are ignored.
    ///
    /// Removing the last callback of a topic stops its consumer task.
    async fn unsubscribe(&self, topic: &str, callback: &Callback);

    /// Make sure the given topics exist.
    async fn create_topics(&self, topics: &[String]) -> EventBusResult<()>;

    /// Get event bus stats.
    async fn stats(&self) -> EventBusStats;
}

/// Event bus statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventBusStats {
    /// Messages accepted by `publish`
    pub events_published: u64,
    /// Successful callback invocations
    pub events_delivered: u64,
    /// Callback invocations that returned an error or panicked
    pub callback_failures: u64,
    /// Messages dropped (unknown topic, no subscriber, malformed wire data)
    pub dropped_messages: u64,
    /// Registered (topic, callback) pairs
    pub active_subscriptions: usize,
    /// Running consumer tasks
    pub active_consumers: usize,
}

/// Lock-free counters shared between a backend and its consumer tasks.
#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    published: AtomicU64,
    delivered: AtomicU64,
    failures: AtomicU64,
    dropped: AtomicU64,
}

impl StatsCounters {
    pub(crate) fn record_published(&self) {
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, active_subscriptions: usize, active_consumers: usize) -> EventBusStats {
        EventBusStats {
            events_published: self.published.load(Ordering::Relaxed),
            events_delivered: self.delivered.load(Ordering::Relaxed),
            callback_failures: self.failures.load(Ordering::Relaxed),
            dropped_messages: self.dropped.load(Ordering::Relaxed),
            active_subscriptions,
            active_consumers,
        }
    }
}
