//! Broadcast router
//!
//! One router per route. Producers (and `Engine::publish`) push
//! `(topic, delivery)` items into an unbounded queue through a cloneable
//! `RoutePublisher`; a single fan-out task drains the queue in FIFO order and
//! hands each item to every connection currently confirmed for the topic.
//!
//! Delivery never waits on a socket: each connection has its own outbox, so a
//! slow or dead connection cannot hold up the others or the producers.
//!
//! A failure item only tears its topic down while the producer generation
//! that raised it is still the registered one.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::broker::connection::ConnectionManager;
use crate::broker::producer::ProducerManager;
use crate::topic::Topic;
use crate::transport::message::Envelope;

#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    Update(Value),
    /// The producer of the given generation gave up; subscribers get one
    /// error message and the topic is torn down.
    Failure { generation: u64, message: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct RouteItem {
    pub topic: Topic,
    pub delivery: Delivery,
}

/// Sending half of a route queue.
#[derive(Debug, Clone)]
pub struct RoutePublisher {
    route: Arc<str>,
    tx: mpsc::UnboundedSender<RouteItem>,
}

/// Receiving half of a route queue, consumed by the fan-out task.
#[derive(Debug)]
pub struct RouteInbox {
    route: Arc<str>,
    rx: mpsc::UnboundedReceiver<RouteItem>,
}

pub fn channel(route: &str) -> (RoutePublisher, RouteInbox) {
    let route: Arc<str> = Arc::from(route);
    let (tx, rx) = mpsc::unbounded_channel();
    (
        RoutePublisher {
            route: route.clone(),
            tx,
        },
        RouteInbox { route, rx },
    )
}

impl RoutePublisher {
    pub fn route(&self) -> &str {
        &self.route
    }

    /// Enqueues a value without waiting. Returns `false` if the router is gone.
    pub fn publish(&self, topic: Topic, payload: Value) -> bool {
        self.send(RouteItem {
            topic,
            delivery: Delivery::Update(payload),
        })
    }

    pub fn publish_failure(
        &self,
        topic: Topic,
        generation: u64,
        message: impl Into<String>,
    ) -> bool {
        self.send(RouteItem {
            topic,
            delivery: Delivery::Failure {
                generation,
                message: message.into(),
            },
        })
    }

    fn send(&self, item: RouteItem) -> bool {
        debug_assert_eq!(item.topic.route(), &*self.route);
        if self.tx.send(item).is_err() {
            debug!(route = %self.route, "route queue closed, item discarded");
            return false;
        }
        true
    }
}

impl RouteInbox {
    pub fn route(&self) -> &str {
        &self.route
    }

    #[cfg(test)]
    pub(crate) fn try_recv(&mut self) -> Option<RouteItem> {
        self.rx.try_recv().ok()
    }
}

/// Handle on a running fan-out task.
#[derive(Debug)]
pub struct BroadcastRouter {
    route: Arc<str>,
    handle: JoinHandle<()>,
}

impl BroadcastRouter {
    /// Spawns the fan-out task for `inbox`. Must be called inside a Tokio runtime.
    pub fn spawn(
        inbox: RouteInbox,
        connections: Arc<ConnectionManager>,
        producers: Arc<ProducerManager>,
        shutdown: CancellationToken,
    ) -> Self {
        let route = inbox.route.clone();
        let handle = tokio::spawn(fan_out(inbox, connections, producers, shutdown));
        Self { route, handle }
    }

    pub fn route(&self) -> &str {
        &self.route
    }

    /// Waits for the fan-out task to end (after shutdown or when every
    /// publisher is dropped).
    pub async fn join(self) {
        if let Err(e) = self.handle.await {
            error!(route = %self.route, "fan-out task failed: {e}");
        }
    }
}

async fn fan_out(
    mut inbox: RouteInbox,
    connections: Arc<ConnectionManager>,
    producers: Arc<ProducerManager>,
    shutdown: CancellationToken,
) {
    debug!(route = %inbox.route, "fan-out started");

    loop {
        let item = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            item = inbox.rx.recv() => match item {
                Some(item) => item,
                None => break,
            },
        };

        match item.delivery {
            Delivery::Update(payload) => {
                let msg = match Envelope::update(&item.topic, payload).to_ws() {
                    Ok(msg) => msg,
                    Err(e) => {
                        error!(topic = %item.topic, "failed to serialize update: {e}");
                        continue;
                    }
                };
                let delivered = connections.deliver(&item.topic, &msg);
                trace!(topic = %item.topic, delivered, "update fanned out");
            }
            Delivery::Failure {
                generation,
                message,
            } => {
                if !producers.is_current(&item.topic, generation) {
                    debug!(topic = %item.topic, generation, "stale producer failure dropped");
                    continue;
                }
                let notice = Envelope::error(&item.topic, &message)
                    .to_ws()
                    .inspect_err(|e| error!(topic = %item.topic, "failed to serialize error: {e}"))
                    .ok();
                let evicted = connections.evict_topic(&item.topic, notice.as_ref()).await;
                warn!(topic = %item.topic, evicted, "topic torn down after producer failure: {message}");
            }
        }
    }

    debug!(route = %inbox.route, "fan-out stopped");
}
