//! Subscription registry
//!
//! Reference counts subscribers per topic and drives the topic lifecycle:
//! the 0→1 transition activates the topic, the 1→0 transition deactivates it
//! and removes the record.
//!
//! Concurrency notes:
//! - Every topic has its own async mutex. Operations on the same topic are
//!   serialized, operations on different topics never wait on each other.
//! - The lifecycle callbacks run while the topic's mutex is held, so a
//!   deactivation (which awaits producer termination) always completes before
//!   a following activation of the same topic starts.
//! - A slot removed on deactivation is marked retired; a caller that raced
//!   the removal and locked the stale slot retries against the map.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::debug;

use crate::topic::Topic;

/// Callbacks fired on refcount transitions.
#[async_trait]
pub trait TopicLifecycle: Send + Sync {
    /// Called once when a topic gains its first subscriber.
    async fn activate(&self, topic: &Topic);

    /// Called for every subscriber after the first, so a topic whose
    /// activity ended on its own can be revived for the newcomer.
    async fn joined(&self, _topic: &Topic) {}

    /// Called once when a topic loses its last subscriber. Must not return
    /// before everything started by `activate` has stopped.
    async fn deactivate(&self, topic: &Topic);
}

#[derive(Debug, Default)]
struct Slot {
    refcount: usize,
    retired: bool,
}

pub struct SubscriptionRegistry {
    slots: DashMap<Topic, Arc<Mutex<Slot>>>,
    lifecycle: Arc<dyn TopicLifecycle>,
}

impl SubscriptionRegistry {
    pub fn new(lifecycle: Arc<dyn TopicLifecycle>) -> Self {
        Self {
            slots: DashMap::new(),
            lifecycle,
        }
    }

    /// Increments the topic's refcount. Returns `true` when this call
    /// activated the topic.
    pub async fn subscribe(&self, topic: &Topic) -> bool {
        loop {
            // the shard guard is dropped at the end of this statement
            let slot = self.slots.entry(topic.clone()).or_default().clone();

            let mut guard = slot.lock().await;
            if guard.retired {
                continue;
            }

            guard.refcount += 1;
            if guard.refcount > 1 {
                debug!(topic = %topic, refcount = guard.refcount, "joined active topic");
                self.lifecycle.joined(topic).await;
                return false;
            }

            debug!(topic = %topic, "activating topic");
            self.lifecycle.activate(topic).await;
            return true;
        }
    }

    /// Decrements the topic's refcount. Returns `true` when this call
    /// deactivated the topic. Unknown topics and zero counts are a no-op.
    pub async fn unsubscribe(&self, topic: &Topic) -> bool {
        let Some(slot) = self.slots.get(topic).map(|entry| entry.value().clone()) else {
            debug!(topic = %topic, "unsubscribe for inactive topic ignored");
            return false;
        };

        let mut guard = slot.lock().await;
        if guard.retired || guard.refcount == 0 {
            return false;
        }

        guard.refcount -= 1;
        if guard.refcount > 0 {
            debug!(topic = %topic, refcount = guard.refcount, "left active topic");
            return false;
        }

        debug!(topic = %topic, "deactivating topic");
        self.lifecycle.deactivate(topic).await;
        guard.retired = true;
        self.slots
            .remove_if(topic, |_, current| Arc::ptr_eq(current, &slot));
        true
    }

    /// Current refcount, `0` for unknown topics.
    pub async fn refcount(&self, topic: &Topic) -> usize {
        let Some(slot) = self.slots.get(topic).map(|entry| entry.value().clone()) else {
            return 0;
        };
        let guard = slot.lock().await;
        if guard.retired { 0 } else { guard.refcount }
    }

    /// Number of topic records, including ones mid-transition.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn topics(&self) -> Vec<Topic> {
        self.slots.iter().map(|entry| entry.key().clone()).collect()
    }
}

impl std::fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("topics", &self.slots.len())
            .finish()
    }
}
