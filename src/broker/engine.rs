//! Engine
//!
//! The `Engine` owns the registry, the producer manager, the connection
//! manager and one broadcast router per route. It is built once per process
//! and handed to the transport layer behind an `Arc`.
//!
//! Wiring order: route queues → producers (hold the publishing halves) →
//! registry (drives the producers) → connections (drive the registry) →
//! fan-out tasks (read the queues, check failures against the producers,
//! write to connections).

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::Mutex;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::broker::connection::ConnectionManager;
use crate::broker::producer::{ProducerManager, ProducerPolicy, ProducerRoute};
use crate::broker::registry::SubscriptionRegistry;
use crate::broker::router::{self, BroadcastRouter, RoutePublisher};
use crate::broker::source::DataSource;
use crate::config::EngineSettings;
use crate::topic::{Topic, validate_route};
use crate::utils::error::{EngineError, Result};

pub struct EngineBuilder {
    settings: EngineSettings,
    routes: Vec<(String, Arc<dyn DataSource>)>,
}

impl EngineBuilder {
    pub fn new(settings: EngineSettings) -> Self {
        Self {
            settings,
            routes: Vec::new(),
        }
    }

    /// Registers a route served by `source`.
    pub fn route(self, name: impl Into<String>, source: impl DataSource + 'static) -> Self {
        self.shared_route(name, Arc::new(source))
    }

    pub fn shared_route(mut self, name: impl Into<String>, source: Arc<dyn DataSource>) -> Self {
        self.routes.push((name.into(), source));
        self
    }

    /// Wires the engine and spawns the fan-out tasks; needs a Tokio runtime.
    pub fn build(self) -> Result<Engine> {
        let mut publishers = HashMap::new();
        let mut producer_routes = HashMap::new();
        let mut inboxes = Vec::with_capacity(self.routes.len());

        for (name, source) in self.routes {
            validate_route(&name)?;
            if publishers.contains_key(&name) {
                return Err(EngineError::InvalidRoute(format!("{name} (registered twice)")));
            }
            let (publisher, inbox) = router::channel(&name);
            producer_routes.insert(name.clone(), ProducerRoute::new(source, publisher.clone()));
            publishers.insert(name, publisher);
            inboxes.push(inbox);
        }

        let producers = Arc::new(ProducerManager::new(
            producer_routes,
            ProducerPolicy::from(&self.settings),
        ));
        let registry = Arc::new(SubscriptionRegistry::new(producers.clone()));
        let connections = Arc::new(ConnectionManager::new(
            registry.clone(),
            self.settings.outbox_capacity,
        ));

        let shutdown = CancellationToken::new();
        let routers = inboxes
            .into_iter()
            .map(|inbox| {
                BroadcastRouter::spawn(
                    inbox,
                    connections.clone(),
                    producers.clone(),
                    shutdown.child_token(),
                )
            })
            .collect();

        let mut names: Vec<&String> = publishers.keys().collect();
        names.sort();
        info!(routes = ?names, "engine started");

        Ok(Engine {
            registry,
            producers,
            connections,
            publishers,
            routers: Mutex::new(routers),
            shutdown,
        })
    }
}

pub struct Engine {
    registry: Arc<SubscriptionRegistry>,
    producers: Arc<ProducerManager>,
    connections: Arc<ConnectionManager>,
    publishers: HashMap<String, RoutePublisher>,
    routers: Mutex<Vec<BroadcastRouter>>,
    shutdown: CancellationToken,
}

impl Engine {
    pub fn builder(settings: EngineSettings) -> EngineBuilder {
        EngineBuilder::new(settings)
    }

    pub fn has_route(&self, route: &str) -> bool {
        self.publishers.contains_key(route)
    }

    /// Registered route names, sorted.
    pub fn routes(&self) -> Vec<&str> {
        let mut routes: Vec<&str> = self.publishers.keys().map(String::as_str).collect();
        routes.sort_unstable();
        routes
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    pub fn producers(&self) -> &Arc<ProducerManager> {
        &self.producers
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    /// Pushes an externally produced value (e.g. an order event) through the
    /// topic's route queue, exactly like a producer tick.
    pub fn publish(&self, topic: &Topic, payload: Value) -> Result<()> {
        let publisher = self
            .publishers
            .get(topic.route())
            .ok_or_else(|| EngineError::UnknownRoute(topic.route().to_string()))?;
        publisher.publish(topic.clone(), payload);
        Ok(())
    }

    /// Stops every producer, then stops and joins the fan-out tasks.
    pub async fn shutdown(&self) {
        self.producers.stop_all().await;
        self.shutdown.cancel();

        let routers = std::mem::take(&mut *self.routers.lock());
        join_all(routers.into_iter().map(BroadcastRouter::join)).await;
        info!("engine stopped");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("routes", &self.routes())
            .field("registry", &self.registry)
            .field("producers", &self.producers)
            .field("connections", &self.connections)
            .finish()
    }
}
