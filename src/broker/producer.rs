//! Producer manager
//!
//! Owns one cancellable task per active topic. A producer repeatedly asks
//! the route's `DataSource` for a value, publishes it on the route queue and
//! sleeps for the tick interval.
//!
//! Failure policy: source errors (and panics) are retried with exponential
//! backoff. After `max_retries` consecutive failures the producer publishes a
//! single failure item for its topic and exits; the router then tears the
//! topic down through the regular unsubscribe path.
//!
//! Every start gets a fresh generation number. Failure items carry it, so a
//! failure that is still queued after its topic was closed and reopened is
//! recognised as stale and dropped.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::registry::TopicLifecycle;
use crate::broker::router::RoutePublisher;
use crate::broker::source::DataSource;
use crate::config::EngineSettings;
use crate::topic::{Params, Topic, decode};
use crate::utils::backoff::ExponentialBackoff;
use crate::utils::error::SourceError;

/// How long an aborted producer gets to unwind before it is detached.
const ABORT_GRACE: Duration = Duration::from_millis(100);

/// Timing and retry knobs shared by all producers.
#[derive(Debug, Clone)]
pub struct ProducerPolicy {
    pub tick_interval: Duration,
    pub stop_timeout: Duration,
    pub max_retries: u32,
    pub retry_backoff: ExponentialBackoff,
}

impl From<&EngineSettings> for ProducerPolicy {
    fn from(settings: &EngineSettings) -> Self {
        Self {
            tick_interval: settings.tick_interval(),
            stop_timeout: settings.producer_stop_timeout(),
            max_retries: settings.producer_max_retries,
            retry_backoff: ExponentialBackoff::from_millis(
                settings.producer_retry_base_ms,
                settings.producer_retry_max_ms,
            ),
        }
    }
}

impl Default for ProducerPolicy {
    fn default() -> Self {
        Self::from(&EngineSettings::default())
    }
}

/// Source and output queue for one route.
#[derive(Clone)]
pub struct ProducerRoute {
    source: Arc<dyn DataSource>,
    publisher: RoutePublisher,
}

impl ProducerRoute {
    pub fn new(source: Arc<dyn DataSource>, publisher: RoutePublisher) -> Self {
        Self { source, publisher }
    }
}

#[derive(Debug)]
struct ProducerHandle {
    generation: u64,
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

#[derive(Debug, Default)]
struct ProducerCounters {
    started: AtomicU64,
    stopped: AtomicU64,
    forced: AtomicU64,
}

pub struct ProducerManager {
    routes: HashMap<String, ProducerRoute>,
    running: DashMap<Topic, ProducerHandle>,
    policy: ProducerPolicy,
    counters: ProducerCounters,
    generations: AtomicU64,
}

impl ProducerManager {
    pub fn new(routes: HashMap<String, ProducerRoute>, policy: ProducerPolicy) -> Self {
        Self {
            routes,
            running: DashMap::new(),
            policy,
            counters: ProducerCounters::default(),
            generations: AtomicU64::new(0),
        }
    }

    /// Starts the producer for `topic`. A no-op while one is already running.
    pub fn start(&self, topic: &Topic) {
        let (route_name, params) = match decode(topic.as_str()) {
            Ok(decoded) => decoded,
            Err(e) => {
                error!(topic = %topic, "cannot start producer: {e}");
                return;
            }
        };
        let Some(route) = self.routes.get(&route_name) else {
            error!(topic = %topic, route = %route_name, "cannot start producer: no source for route");
            return;
        };

        match self.running.entry(topic.clone()) {
            Entry::Occupied(entry) if !entry.get().join.is_finished() => {
                debug!(topic = %topic, "producer already running");
            }
            entry => {
                // a finished leftover (producer gave up) is replaced
                let generation = self.generations.fetch_add(1, Ordering::Relaxed) + 1;
                let cancel = CancellationToken::new();
                let join = tokio::spawn(run_producer(
                    topic.clone(),
                    generation,
                    params,
                    route.clone(),
                    self.policy.clone(),
                    cancel.clone(),
                ));
                entry.insert(ProducerHandle {
                    generation,
                    cancel,
                    join,
                });
                self.counters.started.fetch_add(1, Ordering::Relaxed);
                info!(topic = %topic, generation, "producer started");
            }
        }
    }

    /// Cancels the producer for `topic` and waits for it to finish. A producer
    /// that ignores cancellation past the stop deadline is aborted; one that
    /// cannot even be aborted (it blocks its thread) is detached after a
    /// short grace period so the caller never hangs.
    /// Returns `false` if no producer was registered.
    pub async fn stop(&self, topic: &Topic) -> bool {
        let Some((_, handle)) = self.running.remove(topic) else {
            debug!(topic = %topic, "no producer to stop");
            return false;
        };

        handle.cancel.cancel();
        let mut join = handle.join;
        match tokio::time::timeout(self.policy.stop_timeout, &mut join).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) if e.is_panic() => error!(topic = %topic, "producer task panicked"),
            Ok(Err(_)) => {}
            Err(_) => {
                warn!(
                    topic = %topic,
                    timeout_ms = self.policy.stop_timeout.as_millis() as u64,
                    "producer ignored cancellation, aborting"
                );
                self.counters.forced.fetch_add(1, Ordering::Relaxed);
                join.abort();
                if tokio::time::timeout(ABORT_GRACE, join).await.is_err() {
                    error!(topic = %topic, "producer still blocked after abort, detaching it");
                }
            }
        }

        self.counters.stopped.fetch_add(1, Ordering::Relaxed);
        info!(topic = %topic, "producer stopped");
        true
    }

    /// Stops every producer, e.g. on shutdown.
    pub async fn stop_all(&self) {
        for topic in self.running_topics() {
            self.stop(&topic).await;
        }
    }

    /// Whether `generation` is the producer currently registered for `topic`.
    pub fn is_current(&self, topic: &Topic, generation: u64) -> bool {
        self.running
            .get(topic)
            .is_some_and(|handle| handle.generation == generation)
    }

    pub fn generation(&self, topic: &Topic) -> Option<u64> {
        self.running.get(topic).map(|handle| handle.generation)
    }

    pub fn is_running(&self, topic: &Topic) -> bool {
        self.running
            .get(topic)
            .is_some_and(|handle| !handle.join.is_finished())
    }

    pub fn running_topics(&self) -> Vec<Topic> {
        self.running.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Number of registered producers (a producer that gave up stays
    /// registered until its topic is deactivated).
    pub fn len(&self) -> usize {
        self.running.len()
    }

    pub fn is_empty(&self) -> bool {
        self.running.is_empty()
    }

    pub fn started_total(&self) -> u64 {
        self.counters.started.load(Ordering::Relaxed)
    }

    pub fn stopped_total(&self) -> u64 {
        self.counters.stopped.load(Ordering::Relaxed)
    }

    pub fn forced_total(&self) -> u64 {
        self.counters.forced.load(Ordering::Relaxed)
    }

    pub fn policy(&self) -> &ProducerPolicy {
        &self.policy
    }
}

#[async_trait]
impl TopicLifecycle for ProducerManager {
    async fn activate(&self, topic: &Topic) {
        self.start(topic);
    }

    async fn joined(&self, topic: &Topic) {
        // a producer that gave up is restarted for the newcomer
        let gave_up = self
            .running
            .get(topic)
            .is_some_and(|handle| handle.join.is_finished());
        if gave_up {
            self.start(topic);
        }
    }

    async fn deactivate(&self, topic: &Topic) {
        self.stop(topic).await;
    }
}

impl std::fmt::Debug for ProducerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProducerManager")
            .field("routes", &self.routes.keys().collect::<Vec<_>>())
            .field("running", &self.running.len())
            .finish()
    }
}

async fn fetch_guarded(
    source: &dyn DataSource,
    params: &Params,
    tick: u64,
) -> Result<serde_json::Value, SourceError> {
    match AssertUnwindSafe(source.fetch(params, tick)).catch_unwind().await {
        Ok(result) => result,
        Err(_) => Err(SourceError::new("data source panicked")),
    }
}

async fn run_producer(
    topic: Topic,
    generation: u64,
    params: Params,
    route: ProducerRoute,
    policy: ProducerPolicy,
    cancel: CancellationToken,
) {
    let mut tick: u64 = 0;
    let mut failures: u32 = 0;

    loop {
        let fetched = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = fetch_guarded(route.source.as_ref(), &params, tick) => result,
        };

        let delay = match fetched {
            Ok(value) => {
                failures = 0;
                tick += 1;
                if !route.publisher.publish(topic.clone(), value) {
                    break;
                }
                policy.tick_interval
            }
            Err(e) => {
                failures += 1;
                if failures > policy.max_retries {
                    error!(topic = %topic, generation, failures, "producer giving up: {e}");
                    route.publisher.publish_failure(
                        topic.clone(),
                        generation,
                        format!("producer failed: {e}"),
                    );
                    break;
                }
                let delay = policy.retry_backoff.delay(failures);
                warn!(
                    topic = %topic,
                    failures,
                    retry_in_ms = delay.as_millis() as u64,
                    "producer tick failed: {e}"
                );
                delay
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    debug!(topic = %topic, ticks = tick, "producer loop exited");
}
