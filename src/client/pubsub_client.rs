//! Consumer-side connection.
//!
//! One WebSocket per `ClientConnection`, multiplexing any number of logical
//! subscriptions. The connection moves through
//! `Connecting → Connected → Reconnecting → Connecting → ...` and settles in
//! `Disconnected` after `shutdown` or when reconnect attempts run out.
//!
//! Every tracked topic is `Requested` until the server acknowledges it, then
//! `Confirmed`. When the socket drops all topics fall back to `Requested` and
//! are replayed once on the next successful connect. An unsubscribe removes
//! the topic from the tracked set immediately, so it is never replayed.
//!
//! The server answers subscribe frames in order, so the client counts the
//! acks it still expects per topic. A topic is settled only by the ack for
//! its latest request; acks for requests withdrawn in between are skipped.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::connect_async;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tungstenite::protocol::Message as WsMessage;

use crate::config::ClientSettings;
use crate::topic::{Topic, encode_json};
use crate::transport::message::{AckStatus, Envelope, Operation};
use crate::utils::backoff::ExponentialBackoff;
use crate::utils::error::{EngineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicState {
    /// Subscribe sent (or waiting to be sent), no acknowledgement yet.
    Requested,
    Confirmed,
}

/// What a `Subscription` yields.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Update(Value),
    /// The server refused the subscription; the topic is no longer tracked.
    Rejected(String),
    /// The topic's producer failed on the server; the topic is no longer
    /// tracked and may be subscribed again.
    Failed(String),
}

/// Stream of events for one topic. Ends when the topic is unsubscribed,
/// rejected or failed, or when the client shuts down.
#[derive(Debug)]
pub struct Subscription {
    topic: Topic,
    events: mpsc::UnboundedReceiver<ClientEvent>,
}

impl Subscription {
    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    pub async fn next(&mut self) -> Option<ClientEvent> {
        self.events.recv().await
    }
}

#[derive(Debug)]
struct TrackedTopic {
    route: String,
    params: Value,
    state: TopicState,
    listeners: Vec<mpsc::UnboundedSender<ClientEvent>>,
}

impl TrackedTopic {
    fn subscribe_frame(&self) -> Result<WsMessage> {
        Envelope::subscribe(&self.route, self.params.clone()).to_ws()
    }

    fn notify(&mut self, event: ClientEvent) {
        self.listeners
            .retain(|listener| listener.send(event.clone()).is_ok());
    }
}

#[derive(Debug, Default)]
struct State {
    topics: HashMap<Topic, TrackedTopic>,
    /// Present only while connected.
    outbound: Option<mpsc::UnboundedSender<WsMessage>>,
    /// Subscribe frames sent on the current socket and not yet acknowledged.
    awaiting_acks: HashMap<Topic, u32>,
}

#[derive(Debug)]
struct Shared {
    settings: ClientSettings,
    state: Mutex<State>,
    status: watch::Sender<ConnectionStatus>,
    shutdown: CancellationToken,
}

/// Cloneable handle on a client connection; all clones share one socket.
#[derive(Debug, Clone)]
pub struct ClientConnection {
    shared: Arc<Shared>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl ClientConnection {
    /// Starts connecting in the background. Must be called inside a Tokio
    /// runtime.
    pub fn connect(settings: ClientSettings) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::Connecting);
        let shared = Arc::new(Shared {
            settings,
            state: Mutex::new(State::default()),
            status,
            shutdown: CancellationToken::new(),
        });
        let task = tokio::spawn(run(shared.clone()));
        Self {
            shared,
            task: Arc::new(Mutex::new(Some(task))),
        }
    }

    /// Tracks a topic and requests it from the server (now, or on the next
    /// connect). Subscribing to an already tracked topic adds a listener
    /// without sending anything.
    pub fn subscribe(&self, route: &str, params: Value) -> Result<Subscription> {
        if self.shared.shutdown.is_cancelled() {
            return Err(EngineError::ClientClosed);
        }
        let topic = encode_json(route, &params)?;
        let (tx, rx) = mpsc::unbounded_channel();

        let mut state = self.shared.state.lock();
        let State {
            topics,
            outbound,
            awaiting_acks,
        } = &mut *state;
        if let Some(tracked) = topics.get_mut(&topic) {
            tracked.listeners.push(tx);
        } else {
            let tracked = TrackedTopic {
                route: route.to_string(),
                params,
                state: TopicState::Requested,
                listeners: vec![tx],
            };
            if let Some(outbound) = outbound {
                let _ = outbound.send(tracked.subscribe_frame()?);
                *awaiting_acks.entry(topic.clone()).or_default() += 1;
            }
            debug!(topic = %topic, "subscription requested");
            topics.insert(topic.clone(), tracked);
        }

        Ok(Subscription { topic, events: rx })
    }

    /// Stops tracking a topic. Returns `false` if it was not tracked.
    pub fn unsubscribe(&self, route: &str, params: Value) -> Result<bool> {
        let topic = encode_json(route, &params)?;

        let mut state = self.shared.state.lock();
        let Some(tracked) = state.topics.remove(&topic) else {
            return Ok(false);
        };
        // while disconnected the server holds nothing for this socket
        if let Some(outbound) = &state.outbound {
            let _ = outbound.send(Envelope::unsubscribe(&tracked.route, tracked.params).to_ws()?);
        }
        debug!(topic = %topic, "unsubscribed");
        Ok(true)
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.shared.status.borrow()
    }

    /// Waits until the connection reaches `wanted`.
    pub async fn wait_for_status(&self, wanted: ConnectionStatus) -> Result<()> {
        let mut status = self.shared.status.subscribe();
        status
            .wait_for(|current| *current == wanted)
            .await
            .map(|_| ())
            .map_err(|_| EngineError::ClientClosed)
    }

    pub fn topic_state(&self, topic: &Topic) -> Option<TopicState> {
        self.shared.state.lock().topics.get(topic).map(|t| t.state)
    }

    /// Tracked topics, sorted.
    pub fn tracked_topics(&self) -> Vec<Topic> {
        let mut topics: Vec<Topic> = self.shared.state.lock().topics.keys().cloned().collect();
        topics.sort();
        topics
    }

    /// Closes the socket, cancels any pending reconnect and waits for the
    /// background task.
    pub async fn shutdown(&self) {
        self.shared.shutdown.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!("client task failed: {e}");
            }
        }
    }
}

async fn run(shared: Arc<Shared>) {
    let settings = &shared.settings;
    let backoff = ExponentialBackoff::from_millis(settings.base_delay_ms, settings.max_delay_ms);
    let mut retries: u32 = 0;

    loop {
        shared.status.send_replace(ConnectionStatus::Connecting);
        let connected = tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            result = connect_async(settings.url.as_str()) => result,
        };

        match connected {
            Ok((ws, _)) => {
                retries = 0;
                info!(url = %settings.url, "connected");
                let reason = drive(&shared, ws).await;
                if shared.shutdown.is_cancelled() {
                    break;
                }
                warn!(url = %settings.url, "connection lost: {reason}");
            }
            Err(e) => warn!(url = %settings.url, "connect failed: {e}"),
        }

        if settings.max_retries.is_some_and(|max| retries >= max) {
            error!(url = %settings.url, retries, "giving up reconnecting");
            break;
        }
        retries += 1;
        let delay = backoff.delay(retries);
        shared.status.send_replace(ConnectionStatus::Reconnecting);
        debug!(attempt = retries, delay_ms = delay.as_millis() as u64, "reconnecting");

        tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    // dropping the listeners ends every Subscription
    shared.shutdown.cancel();
    shared.state.lock().topics.clear();
    shared.status.send_replace(ConnectionStatus::Disconnected);
    info!(url = %settings.url, "client disconnected");
}

/// Runs one connected session and returns why it ended.
async fn drive<S>(shared: &Shared, ws: S) -> &'static str
where
    S: futures_util::Stream<Item = std::result::Result<WsMessage, tungstenite::Error>>
        + futures_util::Sink<WsMessage, Error = tungstenite::Error>
        + Unpin,
{
    let (mut sink, mut stream) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel();

    {
        let mut state = shared.state.lock();
        let State {
            topics,
            awaiting_acks,
            ..
        } = &mut *state;
        awaiting_acks.clear();
        let mut replayed = 0;
        for (topic, tracked) in topics.iter_mut() {
            tracked.state = TopicState::Requested;
            match tracked.subscribe_frame() {
                Ok(frame) => {
                    let _ = tx.send(frame);
                    awaiting_acks.insert(topic.clone(), 1);
                    replayed += 1;
                }
                Err(e) => error!(topic = %topic, "failed to encode subscribe: {e}"),
            }
        }
        state.outbound = Some(tx);
        if replayed > 0 {
            info!(topics = replayed, "replaying subscriptions");
        }
    }
    shared.status.send_replace(ConnectionStatus::Connected);

    let heartbeat = shared.settings.heartbeat_interval();
    let heartbeat_enabled = !heartbeat.is_zero();
    let mut keepalive = tokio::time::interval((heartbeat / 2).max(Duration::from_millis(1)));
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
    keepalive.reset();
    let idle = tokio::time::sleep(heartbeat);
    tokio::pin!(idle);

    let reason = loop {
        tokio::select! {
            biased;
            _ = shared.shutdown.cancelled() => {
                let _ = sink.send(WsMessage::Close(None)).await;
                break "shutdown";
            }
            Some(msg) = rx.recv() => {
                if let Err(e) = sink.send(msg).await {
                    debug!("write failed: {e}");
                    break "write failed";
                }
            }
            _ = keepalive.tick(), if heartbeat_enabled => {
                if let Err(e) = sink.send(WsMessage::Ping(Default::default())).await {
                    debug!("ping failed: {e}");
                    break "write failed";
                }
            }
            _ = &mut idle, if heartbeat_enabled => break "missed heartbeat",
            frame = stream.next() => {
                idle.as_mut().reset(Instant::now() + heartbeat);
                match frame {
                    Some(Ok(WsMessage::Text(text))) => handle_text(shared, text.as_str()),
                    Some(Ok(WsMessage::Close(_))) | None => break "closed by server",
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!("read failed: {e}");
                        break "read failed";
                    }
                }
            }
        }
    };

    let mut state = shared.state.lock();
    state.outbound = None;
    state.awaiting_acks.clear();
    for tracked in state.topics.values_mut() {
        tracked.state = TopicState::Requested;
    }
    reason
}

fn handle_text(shared: &Shared, text: &str) {
    let envelope = match Envelope::from_text(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!("invalid server message: {e} | {text}");
            return;
        }
    };
    let op = match envelope.message_type() {
        Ok(kind) => kind.op,
        Err(e) => {
            warn!("invalid server message: {e} | {text}");
            return;
        }
    };

    match op {
        Operation::SubscribeResponse => on_subscribe_response(shared, &envelope),
        Operation::Update => {
            let Some(topic) = envelope.topic.as_deref() else {
                warn!("update without topic ignored");
                return;
            };
            // updates for a topic unsubscribed a moment ago are dropped here
            if let Some(tracked) = shared.state.lock().topics.get_mut(topic) {
                tracked.notify(ClientEvent::Update(envelope.payload));
            }
        }
        Operation::Error => {
            let Some(topic) = envelope.topic.as_deref() else {
                warn!("error without topic ignored");
                return;
            };
            let message = envelope.payload["message"]
                .as_str()
                .unwrap_or("topic failed")
                .to_string();
            warn!(topic, "server reported failure: {message}");
            if let Some(mut tracked) = shared.state.lock().topics.remove(topic) {
                tracked.notify(ClientEvent::Failed(message));
            }
        }
        op => warn!("unexpected '{op}' from server"),
    }
}

fn on_subscribe_response(shared: &Shared, envelope: &Envelope) {
    let response = match envelope.subscribe_response_payload() {
        Ok(response) => response,
        Err(e) => {
            warn!("invalid subscribe response: {e}");
            return;
        }
    };
    let Some(topic) = response.topic.as_deref() else {
        warn!(
            "subscribe rejected for an unknown topic: {}",
            response.message.unwrap_or_default()
        );
        return;
    };

    let mut state = shared.state.lock();
    if let Some(awaiting) = state.awaiting_acks.get_mut(topic) {
        *awaiting = awaiting.saturating_sub(1);
        if *awaiting > 0 {
            debug!(topic, awaiting = *awaiting, "ack for a withdrawn request skipped");
            return;
        }
        state.awaiting_acks.remove(topic);
    }
    match response.status {
        AckStatus::Ok => {
            if let Some(tracked) = state.topics.get_mut(topic) {
                tracked.state = TopicState::Confirmed;
                debug!(topic, "subscription confirmed");
            }
        }
        AckStatus::Error => {
            let message = response.message.unwrap_or_else(|| "rejected".to_string());
            warn!(topic, "subscription rejected: {message}");
            if let Some(mut tracked) = state.topics.remove(topic) {
                tracked.notify(ClientEvent::Rejected(message));
            }
        }
    }
}
