//! Topic → callback-set registry.
//!
//! All mutation and snapshot reads go through a single mutex. Callers copy
//! the callback set out with [`SubscriptionRegistry::snapshot`] and invoke
//! it after the lock is released, so a callback may itself subscribe or
//! unsubscribe without deadlocking.

use crate::handler::Callback;
use std::collections::{HashMap, HashSet};
use tokio::sync::Mutex;

/// Outcome of [`SubscriptionRegistry::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// The topic had no callbacks before this one.
    FirstForTopic,
    /// The callback joined an existing set.
    Added,
    /// The callback was already registered for the topic.
    AlreadyPresent,
}

/// Outcome of [`SubscriptionRegistry::remove`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    /// The callback was not registered for the topic.
    NotSubscribed,
    /// The callback was removed; others remain.
    Removed,
    /// The callback was the topic's last one; the topic entry is gone.
    TopicEmptied,
}

/// Mapping of topic to the set of subscribed callbacks.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    topics: Mutex<HashMap<String, HashSet<Callback>>>,
}

impl SubscriptionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` for `topic`.
    pub async fn add(&self, topic: &str, callback: Callback) -> Registration {
        let mut topics = self.topics.lock().await;
        match topics.get_mut(topic) {
            Some(callbacks) => {
                if callbacks.insert(callback) {
                    Registration::Added
                } else {
                    Registration::AlreadyPresent
                }
            }
            None => {
                topics.insert(topic.to_string(), HashSet::from([callback]));
                Registration::FirstForTopic
            }
        }
    }

    /// Remove `callback` from `topic`, dropping the topic entry when empty.
    pub async fn remove(&self, topic: &str, callback: &Callback) -> Removal {
        let mut topics = self.topics.lock().await;
        let Some(callbacks) = topics.get_mut(topic) else {
            return Removal::NotSubscribed;
        };

        if !callbacks.remove(callback) {
            return Removal::NotSubscribed;
        }

        if callbacks.is_empty() {
            topics.remove(topic);
            Removal::TopicEmptied
        } else {
            Removal::Removed
        }
    }

    /// Copy of the callbacks currently registered for `topic`.
    pub async fn snapshot(&self, topic: &str) -> Vec<Callback> {
        let topics = self.topics.lock().await;
        topics
            .get(topic)
            .map(|callbacks| callbacks.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Whether `topic` has at least one callback.
    pub async fn has_subscribers(&self, topic: &str) -> bool {
        self.topics.lock().await.contains_key(topic)
    }

    /// Every registered (topic, callback) pair.
    pub async fn entries(&self) -> Vec<(String, Callback)> {
        let topics = self.topics.lock().await;
        topics
            .iter()
            .flat_map(|(topic, callbacks)| {
                callbacks
                    .iter()
                    .map(move |callback| (topic.clone(), callback.clone()))
            })
            .collect()
    }

    /// Number of registered (topic, callback) pairs.
    pub async fn len(&self) -> usize {
        self.topics.lock().await.values().map(HashSet::len).sum()
    }

    /// Whether no callbacks are registered.
    pub async fn is_empty(&self) -> bool {
        self.topics.lock().await.is_empty()
    }

    /// Drop every entry.
    pub async fn clear(&self) {
        self.topics.lock().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> Callback {
        Callback::from_fn(|_| Ok(()))
    }

    #[tokio::test]
    async fn test_add_outcomes() {
        let registry = SubscriptionRegistry::new();
        let a = noop();
        let b = noop();

        assert_eq!(registry.add("t", a.clone()).await, Registration::FirstForTopic);
        assert_eq!(registry.add("t", a.clone()).await, Registration::AlreadyPresent);
        assert_eq!(registry.add("t", b).await, Registration::Added);
        assert_eq!(registry.len().await, 2);
    }

    #[tokio::test]
    async fn test_remove_outcomes() {
        let registry = SubscriptionRegistry::new();
        let a = noop();
        let b = noop();
        registry.add("t", a.clone()).await;
        registry.add("t", b.clone()).await;

        assert_eq!(registry.remove("t", &noop()).await, Removal::NotSubscribed);
        assert_eq!(registry.remove("other", &a).await, Removal::NotSubscribed);
        assert_eq!(registry.remove("t", &a).await, Removal::Removed);
        assert_eq!(registry.remove("t", &b).await, Removal::TopicEmptied);
        assert!(!registry.has_subscribers("t").await);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_snapshot_is_detached_copy() {
        let registry = SubscriptionRegistry::new();
        let a = noop();
        registry.add("t", a.clone()).await;

        let snapshot = registry.snapshot("t").await;
        registry.remove("t", &a).await;

        assert_eq!(snapshot, vec![a]);
        assert!(registry.snapshot("t").await.is_empty());
    }

    #[tokio::test]
    async fn test_entries_and_clear() {
        let registry = SubscriptionRegistry::new();
        let a = noop();
        registry.add("t1", a.clone()).await;
        registry.add("t2", a.clone()).await;

        let mut topics: Vec<String> = registry.entries().await.into_iter().map(|(t, _)| t).collect();
        topics.sort();
        assert_eq!(topics, vec!["t1", "t2"]);

        registry.clear().await;
        assert!(registry.entries().await.is_empty());
    }
}
