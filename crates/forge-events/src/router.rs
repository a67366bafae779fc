//! Per-topic consumer tasks shared by every backend.
//!
//! The first subscriber of a topic opens a [`MessageSource`] for it and
//! spawns one consumer task that polls the source with a bounded timeout.
//! Each task owns a [`CancellationToken`] handed to it at spawn time; `stop`
//! and last-subscriber `unsubscribe` cancel the token and join the task with
//! a bounded timeout. A task that overruns the timeout is detached, never
//! aborted. A callback that tears down its own topic's consumer only cancels
//! it; the join would wait on the callback itself.
//!
//! When a source ends on its own the task removes its handle, so the next
//! `subscribe` to that topic opens a fresh source.
//!
//! Lock order is always consumers map → registry. The registry lock is only
//! held to copy a topic's callback set; callbacks run without any lock held.

use crate::bus::{EventBusStats, StatsCounters};
use crate::config::Timeouts;
use crate::error::{EventBusError, EventBusResult};
use crate::handler::Callback;
use crate::message::Message;
use crate::registry::{Registration, Removal, SubscriptionRegistry};
use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// A stream of messages for one topic.
#[async_trait]
pub(crate) trait MessageSource: Send + 'static {
    /// Wait for the next message.
    ///
    /// Returns `Ok(None)` once the underlying stream has ended for good.
    /// A [`EventBusError::SerializationError`] means one malformed message
    /// was skipped; the source stays usable.
    async fn next_message(&mut self) -> EventBusResult<Option<Message>>;

    /// Release transport resources before the consumer task exits.
    async fn close(&mut self) {}
}

type ConsumerMap = Arc<Mutex<HashMap<String, ConsumerHandle>>>;

/// Router and topic of the consumer currently running a callback.
#[derive(Clone)]
struct DispatchScope {
    router: usize,
    topic: String,
}

tokio::task_local! {
    static DISPATCHING: DispatchScope;
}

/// Handle to a running consumer task.
#[derive(Debug)]
struct ConsumerHandle {
    id: u64,
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl ConsumerHandle {
    fn cancel(&self) {
        self.token.cancel();
    }

    async fn join(self, topic: &str, timeout: Duration) {
        match tokio::time::timeout(timeout, self.task).await {
            Ok(Ok(())) => debug!(topic = %topic, "Consumer task joined"),
            Ok(Err(e)) if e.is_panic() => error!(topic = %topic, "Consumer task panicked"),
            Ok(Err(e)) => warn!(topic = %topic, error = %e, "Consumer task ended abnormally"),
            Err(_) => warn!(
                topic = %topic,
                timeout_ms = timeout.as_millis() as u64,
                "Consumer task did not exit in time, abandoning it"
            ),
        }
    }
}

/// Everything a consumer task needs besides its source.
struct ConsumerContext {
    id: u64,
    scope: DispatchScope,
    registry: Arc<SubscriptionRegistry>,
    consumers: ConsumerMap,
    stats: Arc<StatsCounters>,
    token: CancellationToken,
    poll_interval: Duration,
}

/// Consumer loop for one topic.
async fn run_consumer<S: MessageSource>(mut source: S, ctx: ConsumerContext) {
    let topic = ctx.scope.topic.clone();
    info!(topic = %topic, "Consumer task started");

    let mut ended = false;
    loop {
        let polled = tokio::select! {
            biased;
            () = ctx.token.cancelled() => break,
            polled = tokio::time::timeout(ctx.poll_interval, source.next_message()) => polled,
        };

        match polled {
            // Idle poll interval, re-check cancellation.
            Err(_) => continue,
            Ok(Ok(Some(message))) => {
                let callbacks = ctx.registry.snapshot(&topic).await;
                dispatch(&ctx.scope, message, callbacks, &ctx.stats).await;
            }
            Ok(Ok(None)) => {
                warn!(topic = %topic, "Message stream ended");
                ended = true;
                break;
            }
            Ok(Err(EventBusError::SerializationError(reason))) => {
                ctx.stats.record_dropped();
                warn!(topic = %topic, error = %reason, "Skipping malformed message");
            }
            Ok(Err(e)) => {
                warn!(topic = %topic, error = %e, "Consumer poll failed");
                tokio::select! {
                    biased;
                    () = ctx.token.cancelled() => break,
                    () = tokio::time::sleep(ctx.poll_interval) => {}
                }
            }
        }
    }

    source.close().await;

    if ended {
        let mut consumers = ctx.consumers.lock().await;
        if consumers.get(&topic).is_some_and(|handle| handle.id == ctx.id) {
            // Dropping our own handle detaches it; the task is about to return.
            consumers.remove(&topic);
        }
    }
    info!(topic = %topic, "Consumer task stopped");
}

/// Invoke every callback with `message`, one after another.
///
/// Each invocation runs on its own task so that an error or a panic in one
/// callback is contained and the rest of the set still receives the message.
/// Awaiting each invocation before the next keeps per-subscriber ordering.
async fn dispatch(
    scope: &DispatchScope,
    message: Message,
    callbacks: Vec<Callback>,
    stats: &StatsCounters,
) {
    let topic = scope.topic.as_str();
    if callbacks.is_empty() {
        stats.record_dropped();
        debug!(topic = %topic, message_id = %message.message_id(), "No subscribers, message dropped");
        return;
    }

    for callback in callbacks {
        let delivery = message.clone();
        let invocation = DISPATCHING.scope(scope.clone(), async move { callback.invoke(delivery).await });
        let outcome = tokio::spawn(invocation).await;

        match outcome {
            Ok(Ok(())) => stats.record_delivered(),
            Ok(Err(e)) => {
                stats.record_failure();
                warn!(
                    topic = %topic,
                    message_id = %message.message_id(),
                    error = %e,
                    "Event callback failed"
                );
            }
            Err(e) => {
                stats.record_failure();
                error!(
                    topic = %topic,
                    message_id = %message.message_id(),
                    error = %e,
                    "Event callback panicked"
                );
            }
        }
    }

    debug!(topic = %topic, message_id = %message.message_id(), "Message dispatched");
}

/// Subscription registry plus the consumer task of every subscribed topic.
#[derive(Debug)]
pub(crate) struct TopicRouter {
    backend: &'static str,
    registry: Arc<SubscriptionRegistry>,
    consumers: ConsumerMap,
    next_consumer_id: AtomicU64,
    stats: Arc<StatsCounters>,
    timeouts: Timeouts,
}

impl TopicRouter {
    pub(crate) fn new(backend: &'static str, timeouts: Timeouts) -> Self {
        Self {
            backend,
            registry: Arc::new(SubscriptionRegistry::new()),
            consumers: Arc::new(Mutex::new(HashMap::new())),
            next_consumer_id: AtomicU64::new(0),
            stats: Arc::new(StatsCounters::default()),
            timeouts,
        }
    }

    pub(crate) fn counters(&self) -> &StatsCounters {
        &self.stats
    }

    pub(crate) fn timeouts(&self) -> &Timeouts {
        &self.timeouts
    }

    fn identity(&self) -> usize {
        Arc::as_ptr(&self.registry) as usize
    }

    /// Topic whose consumer is running the current callback, when that
    /// consumer belongs to this router.
    fn dispatching_topic(&self) -> Option<String> {
        DISPATCHING
            .try_with(|scope| (scope.router == self.identity()).then(|| scope.topic.clone()))
            .ok()
            .flatten()
    }

    /// Join `handle`, or only detach it when called from its own callback.
    async fn release(&self, topic: &str, handle: ConsumerHandle, current: Option<&str>) {
        handle.cancel();
        if current == Some(topic) {
            debug!(backend = self.backend, topic = %topic, "Consumer cancelled from its own callback");
            return;
        }
        handle.join(topic, self.timeouts.join).await;
    }

    fn spawn_consumer<S: MessageSource>(&self, topic: &str, source: S) -> ConsumerHandle {
        let id = self.next_consumer_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        let ctx = ConsumerContext {
            id,
            scope: DispatchScope {
                router: self.identity(),
                topic: topic.to_string(),
            },
            registry: self.registry.clone(),
            consumers: self.consumers.clone(),
            stats: self.stats.clone(),
            token: token.clone(),
            poll_interval: self.timeouts.poll_interval,
        };
        let task = tokio::spawn(run_consumer(source, ctx));

        ConsumerHandle { id, token, task }
    }

    /// Register `callback`, opening a source and spawning a consumer task
    /// when the topic has none running.
    ///
    /// If `open` fails a registration made by this call is rolled back.
    pub(crate) async fn subscribe<S, F, Fut>(
        &self,
        topic: &str,
        callback: Callback,
        open: F,
    ) -> EventBusResult<()>
    where
        S: MessageSource,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = EventBusResult<S>> + Send,
    {
        let mut consumers = self.consumers.lock().await;
        let registration = self.registry.add(topic, callback.clone()).await;

        if consumers.contains_key(topic) {
            match registration {
                Registration::AlreadyPresent => {
                    debug!(backend = self.backend, topic = %topic, "Callback already subscribed")
                }
                _ => info!(backend = self.backend, topic = %topic, "Subscribed to topic"),
            }
            return Ok(());
        }

        let source = match open().await {
            Ok(source) => source,
            Err(e) => {
                if registration != Registration::AlreadyPresent {
                    self.registry.remove(topic, &callback).await;
                }
                return Err(e);
            }
        };

        let handle = self.spawn_consumer(topic, source);
        consumers.insert(topic.to_string(), handle);

        info!(backend = self.backend, topic = %topic, "Subscribed to topic, consumer started");
        Ok(())
    }

    /// Remove `callback`, stopping the topic's consumer task if it was the
    /// last one.
    pub(crate) async fn unsubscribe(&self, topic: &str, callback: &Callback) -> Removal {
        self.unsubscribe_with(topic, callback, || async {}).await
    }

    /// [`unsubscribe`](Self::unsubscribe), running `on_emptied` under the
    /// consumers lock when the topic loses its last callback.
    pub(crate) async fn unsubscribe_with<F, Fut>(&self, topic: &str, callback: &Callback, on_emptied: F) -> Removal
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = ()> + Send,
    {
        let handle = {
            let mut consumers = self.consumers.lock().await;
            match self.registry.remove(topic, callback).await {
                Removal::NotSubscribed => {
                    debug!(backend = self.backend, topic = %topic, "Callback was not subscribed");
                    return Removal::NotSubscribed;
                }
                Removal::Removed => {
                    info!(backend = self.backend, topic = %topic, "Unsubscribed from topic");
                    return Removal::Removed;
                }
                Removal::TopicEmptied => {
                    on_emptied().await;
                    consumers.remove(topic)
                }
            }
        };

        info!(backend = self.backend, topic = %topic, "Last subscriber left, stopping consumer");
        if let Some(handle) = handle {
            let current = self.dispatching_topic();
            self.release(topic, handle, current.as_deref()).await;
        }
        Removal::TopicEmptied
    }

    pub(crate) async fn has_subscribers(&self, topic: &str) -> bool {
        self.registry.has_subscribers(topic).await
    }

    /// Clear the registry, cancel every consumer task and join each one.
    pub(crate) async fn shutdown(&self) {
        let handles: Vec<(String, ConsumerHandle)> = {
            let mut consumers = self.consumers.lock().await;
            self.registry.clear().await;
            consumers.drain().collect()
        };

        for (_, handle) in &handles {
            handle.cancel();
        }

        let current = self.dispatching_topic();
        for (topic, handle) in handles {
            self.release(&topic, handle, current.as_deref()).await;
        }
    }

    pub(crate) async fn stats(&self) -> EventBusStats {
        let active_consumers = self.consumers.lock().await.len();
        let active_subscriptions = self.registry.len().await;
        self.stats.snapshot(active_subscriptions, active_consumers)
    }
}
