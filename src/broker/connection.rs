//! Connection manager
//!
//! Tracks every live connection's `pending` and `confirmed` topic sets and a
//! reverse index (topic → connections) used by the fan-out tasks.
//!
//! Per (connection, topic) the states are:
//! `Unsubscribed → Pending → Confirmed → Unsubscribed`, and any state goes to
//! `Unsubscribed` when the connection closes.
//!
//! Whoever removes a confirmed topic from a connection performs the matching
//! registry decrement. A pending topic's increment belongs to the subscribe
//! call still in flight: removing it only makes that call's confirmation
//! fail, and the call then releases its own increment. Since removal happens
//! under the connection's map entry, every increment is paired with exactly
//! one decrement no matter whether the client unsubscribes, the connection
//! closes or the topic is evicted after a producer failure.
//!
//! Lock ordering: the connection map and the subscriber index are never
//! locked at the same time.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use tracing::{debug, info};
use tungstenite::protocol::Message as WsMessage;
use uuid::Uuid;

use crate::broker::outbox::Outbox;
use crate::broker::registry::SubscriptionRegistry;
use crate::topic::Topic;
use crate::transport::message::Envelope;
use crate::utils::error::{EngineError, Result};

pub type ConnectionId = String;

/// Result of marking a topic pending on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeStep {
    Pending,
    AlreadyPending,
    AlreadyConfirmed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeOutcome {
    /// First subscriber anywhere; the producer was started.
    Activated,
    /// Topic was already active for other connections.
    Joined,
    /// The connection already held the topic; nothing changed.
    Duplicate,
    /// The topic was evicted or the connection closed before confirmation.
    Cancelled,
}

#[derive(Debug)]
struct ConnectionState {
    outbox: Arc<Outbox>,
    confirmed: HashSet<Topic>,
    pending: HashSet<Topic>,
    opened_at: DateTime<Utc>,
}

/// What a connection held for a topic it just gave up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Held {
    Confirmed,
    Pending,
    Nothing,
}

impl ConnectionState {
    fn take(&mut self, topic: &Topic) -> Held {
        if self.confirmed.remove(topic) {
            Held::Confirmed
        } else if self.pending.remove(topic) {
            Held::Pending
        } else {
            Held::Nothing
        }
    }
}

/// Snapshot of one connection's subscriptions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionTopics {
    pub confirmed: Vec<Topic>,
    pub pending: Vec<Topic>,
}

pub struct ConnectionManager {
    registry: Arc<SubscriptionRegistry>,
    connections: DashMap<ConnectionId, ConnectionState>,
    subscribers: DashMap<Topic, HashSet<ConnectionId>>,
    outbox_capacity: usize,
}

impl ConnectionManager {
    pub fn new(registry: Arc<SubscriptionRegistry>, outbox_capacity: usize) -> Self {
        Self {
            registry,
            connections: DashMap::new(),
            subscribers: DashMap::new(),
            outbox_capacity,
        }
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    /// Registers a new connection and returns its id and outbox.
    pub fn open(&self) -> (ConnectionId, Arc<Outbox>) {
        let id = format!("conn-{}", Uuid::new_v4());
        let outbox = Arc::new(Outbox::new(self.outbox_capacity));
        self.connections.insert(
            id.clone(),
            ConnectionState {
                outbox: outbox.clone(),
                confirmed: HashSet::new(),
                pending: HashSet::new(),
                opened_at: Utc::now(),
            },
        );
        debug!(conn = %id, "connection registered");
        (id, outbox)
    }

    /// Subscribes `id` to `topic`: mark pending, increment the registry,
    /// then acknowledge and confirm. Duplicates do not touch the registry;
    /// a duplicate of a confirmed topic is acknowledged again.
    pub async fn subscribe(&self, id: &str, topic: &Topic) -> Result<SubscribeOutcome> {
        // built before any state changes
        let ack = Envelope::subscribe_ok(topic).to_ws()?;

        match self.begin_subscribe(id, topic)? {
            SubscribeStep::Pending => {}
            SubscribeStep::AlreadyPending => return Ok(SubscribeOutcome::Duplicate),
            SubscribeStep::AlreadyConfirmed => {
                if let Some(outbox) = self.outbox(id) {
                    outbox.push_control(ack);
                }
                return Ok(SubscribeOutcome::Duplicate);
            }
        }

        let activated = self.registry.subscribe(topic).await;

        if !self.complete_subscribe(id, topic, Some(ack)).await {
            return Ok(SubscribeOutcome::Cancelled);
        }
        Ok(if activated {
            SubscribeOutcome::Activated
        } else {
            SubscribeOutcome::Joined
        })
    }

    /// Moves `topic` into the connection's pending set.
    pub fn begin_subscribe(&self, id: &str, topic: &Topic) -> Result<SubscribeStep> {
        let mut conn = self
            .connections
            .get_mut(id)
            .ok_or_else(|| EngineError::UnknownConnection(id.to_string()))?;

        if conn.confirmed.contains(topic) {
            Ok(SubscribeStep::AlreadyConfirmed)
        } else if !conn.pending.insert(topic.clone()) {
            Ok(SubscribeStep::AlreadyPending)
        } else {
            Ok(SubscribeStep::Pending)
        }
    }

    /// Finishes a subscribe whose registry increment is done: the topic is
    /// confirmed, or, if it stopped being pending meanwhile (unsubscribe,
    /// close or eviction), the increment is released again.
    pub async fn complete_subscribe(
        &self,
        id: &str,
        topic: &Topic,
        ack: Option<WsMessage>,
    ) -> bool {
        if self.confirm(id, topic, ack) {
            return true;
        }
        debug!(conn = %id, topic = %topic, "subscription cancelled before confirmation");
        self.registry.unsubscribe(topic).await;
        false
    }

    /// Moves `topic` from pending to confirmed, queueing `ack` ahead of any
    /// update for the topic. Returns `false` if the topic is no longer pending.
    fn confirm(&self, id: &str, topic: &Topic, ack: Option<WsMessage>) -> bool {
        {
            let Some(mut conn) = self.connections.get_mut(id) else {
                return false;
            };
            if !conn.pending.remove(topic) {
                return false;
            }
            if let Some(ack) = ack {
                conn.outbox.push_control(ack);
            }
            conn.confirmed.insert(topic.clone());
        }

        self.subscribers
            .entry(topic.clone())
            .or_default()
            .insert(id.to_string());

        // the connection may have closed, or the topic been evicted, between
        // the two critical sections
        let still_held = self
            .connections
            .get(id)
            .is_some_and(|conn| conn.confirmed.contains(topic));
        if !still_held {
            self.remove_subscriber(topic, id);
        }
        true
    }

    /// Drops `topic` from the connection. Returns `false` (a no-op) when the
    /// connection does not hold it.
    pub async fn unsubscribe(&self, id: &str, topic: &Topic) -> bool {
        let held = match self.connections.get_mut(id) {
            Some(mut conn) => conn.take(topic),
            None => Held::Nothing,
        };
        match held {
            Held::Confirmed => {
                self.remove_subscriber(topic, id);
                self.registry.unsubscribe(topic).await;
                true
            }
            Held::Pending => {
                debug!(conn = %id, topic = %topic, "pending subscription withdrawn");
                true
            }
            Held::Nothing => {
                debug!(conn = %id, topic = %topic, "unsubscribe for unheld topic ignored");
                false
            }
        }
    }

    /// Tears down a connection and returns how many topics it held. Every
    /// confirmed topic is decremented here; pending ones are released by
    /// their subscribe calls once confirmation fails.
    pub async fn close(&self, id: &str) -> usize {
        let Some((_, state)) = self.connections.remove(id) else {
            return 0;
        };
        state.outbox.close();

        let confirmed: Vec<Topic> = state.confirmed.into_iter().collect();
        for topic in &confirmed {
            self.remove_subscriber(topic, id);
        }

        join_all(confirmed.iter().map(|topic| self.registry.unsubscribe(topic))).await;

        let held = confirmed.len() + state.pending.len();
        let lifetime = Utc::now() - state.opened_at;
        info!(
            conn = %id,
            topics = held,
            lifetime_ms = lifetime.num_milliseconds(),
            "connection closed"
        );
        held
    }

    /// Removes `topic` from every connection holding it, confirmed or still
    /// joining. Confirmed holders get `notice` and are decremented here;
    /// joiners see their confirmation refused. Returns the number of
    /// evicted connections.
    pub async fn evict_topic(&self, topic: &Topic, notice: Option<&WsMessage>) -> usize {
        self.subscribers.remove(topic);

        // the index misses joiners that are not confirmed yet
        let ids: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|conn| conn.confirmed.contains(topic) || conn.pending.contains(topic))
            .map(|conn| conn.key().clone())
            .collect();

        let mut evicted = 0;
        for id in ids {
            let held = match self.connections.get_mut(&id) {
                Some(mut conn) => {
                    let held = conn.take(topic);
                    if let (Held::Confirmed, Some(notice)) = (held, notice) {
                        conn.outbox.push_control(notice.clone());
                    }
                    held
                }
                None => Held::Nothing,
            };
            match held {
                Held::Confirmed => {
                    // confirmed after the index was cleared
                    self.remove_subscriber(topic, &id);
                    self.registry.unsubscribe(topic).await;
                    evicted += 1;
                }
                Held::Pending => evicted += 1,
                Held::Nothing => {}
            }
        }
        evicted
    }

    /// Queues `msg` for every connection confirmed on `topic`. Never blocks.
    /// Returns the number of connections the message was queued for.
    pub fn deliver(&self, topic: &Topic, msg: &WsMessage) -> usize {
        let ids: Vec<ConnectionId> = match self.subscribers.get(topic) {
            Some(ids) => ids.iter().cloned().collect(),
            None => return 0,
        };

        let mut delivered = 0;
        for id in ids {
            // skipped if the connection went away mid-delivery
            let Some(outbox) = self
                .connections
                .get(&id)
                .filter(|conn| conn.confirmed.contains(topic))
                .map(|conn| conn.outbox.clone())
            else {
                continue;
            };
            if outbox.push_update(msg.clone()) {
                delivered += 1;
            }
        }
        delivered
    }

    pub fn outbox(&self, id: &str) -> Option<Arc<Outbox>> {
        self.connections.get(id).map(|conn| conn.outbox.clone())
    }

    pub fn topics(&self, id: &str) -> Option<ConnectionTopics> {
        self.connections.get(id).map(|conn| {
            let mut confirmed: Vec<Topic> = conn.confirmed.iter().cloned().collect();
            let mut pending: Vec<Topic> = conn.pending.iter().cloned().collect();
            confirmed.sort();
            pending.sort();
            ConnectionTopics { confirmed, pending }
        })
    }

    /// Connections currently confirmed on `topic`.
    pub fn subscriber_count(&self, topic: &Topic) -> usize {
        self.subscribers.get(topic).map_or(0, |ids| ids.len())
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    fn remove_subscriber(&self, topic: &Topic, id: &str) {
        let now_empty = match self.subscribers.get_mut(topic) {
            Some(mut ids) => {
                ids.remove(id);
                ids.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.subscribers.remove_if(topic, |_, ids| ids.is_empty());
        }
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("connections", &self.connections.len())
            .field("topics", &self.subscribers.len())
            .finish()
    }
}
