use super::{ClientConnection, ClientEvent, ConnectionStatus, TopicState};
use crate::config::ClientSettings;
use crate::topic::encode_json;
use crate::transport::message::{Envelope, Operation};
use crate::utils::error::EngineError;
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{Semaphore, mpsc};
use tokio_tungstenite::accept_async;
use tungstenite::protocol::Message as WsMessage;

const WAIT: Duration = Duration::from_secs(3);

enum Command {
    Send(Envelope),
    Drop,
}

/// Minimal server that records every frame, acknowledges subscribes (routes
/// named `rejected` get an error ack, routes named `manual` none at all) and
/// accepts one connection per permit.
struct FakeServer {
    url: String,
    frames: mpsc::UnboundedReceiver<(usize, Envelope)>,
    commands: mpsc::UnboundedSender<Command>,
    accept_permits: Arc<Semaphore>,
}

impl FakeServer {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let (frames_tx, frames) = mpsc::unbounded_channel();
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let accept_permits = Arc::new(Semaphore::new(1));
        tokio::spawn(run_fake_server(
            listener,
            frames_tx,
            commands_rx,
            accept_permits.clone(),
        ));
        Self {
            url,
            frames,
            commands,
            accept_permits,
        }
    }

    async fn next_frame(&mut self) -> (usize, Envelope) {
        tokio::time::timeout(WAIT, self.frames.recv())
            .await
            .expect("timed out waiting for a client frame")
            .expect("fake server stopped")
    }

    /// Frames received within `window`.
    async fn drain(&mut self, window: Duration) -> Vec<(usize, Envelope)> {
        let mut frames = Vec::new();
        let deadline = tokio::time::Instant::now() + window;
        while let Ok(Some(frame)) = tokio::time::timeout_at(deadline, self.frames.recv()).await {
            frames.push(frame);
        }
        frames
    }

    fn send(&self, envelope: Envelope) {
        self.commands.send(Command::Send(envelope)).unwrap();
    }

    fn drop_connection(&self) {
        self.commands.send(Command::Drop).unwrap();
    }

    fn allow_accept(&self) {
        self.accept_permits.add_permits(1);
    }
}

async fn run_fake_server(
    listener: TcpListener,
    frames: mpsc::UnboundedSender<(usize, Envelope)>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    accept_permits: Arc<Semaphore>,
) {
    let mut index = 0;
    loop {
        let Ok(permit) = accept_permits.acquire().await else {
            return;
        };
        permit.forget();
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        let Ok(mut ws) = accept_async(stream).await else {
            continue;
        };

        loop {
            tokio::select! {
                frame = ws.next() => match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        let envelope = Envelope::from_text(text.as_str()).unwrap();
                        let kind = envelope.message_type().unwrap();
                        if kind.op == Operation::Subscribe && kind.route != "manual" {
                            let topic = encode_json(&kind.route, &envelope.payload).unwrap();
                            let ack = if kind.route == "rejected" {
                                Envelope::subscribe_error(&kind.route, Some(&topic), "not allowed")
                            } else {
                                Envelope::subscribe_ok(&topic)
                            };
                            let _ = ws.send(ack.to_ws().unwrap()).await;
                        }
                        let _ = frames.send((index, envelope));
                    }
                    Some(Ok(_)) => {}
                    _ => break,
                },
                command = commands.recv() => match command {
                    Some(Command::Send(envelope)) => {
                        let _ = ws.send(envelope.to_ws().unwrap()).await;
                    }
                    Some(Command::Drop) | None => break,
                },
            }
        }
        index += 1;
    }
}

fn settings(url: &str) -> ClientSettings {
    ClientSettings {
        url: url.to_string(),
        max_retries: None,
        base_delay_ms: 20,
        max_delay_ms: 100,
        heartbeat_interval_ms: 30_000,
    }
}

/// An address nothing listens on.
async fn unused_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("ws://{addr}")
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

async fn connected(url: &str) -> ClientConnection {
    let client = ClientConnection::connect(settings(url));
    tokio::time::timeout(WAIT, client.wait_for_status(ConnectionStatus::Connected))
        .await
        .expect("client did not connect")
        .unwrap();
    client
}

fn x() -> Value {
    json!({"symbol": "AAPL", "resolution": "1"})
}

fn y() -> Value {
    json!({"symbol": "MSFT", "resolution": "1"})
}

#[tokio::test]
async fn test_subscribe_is_confirmed() {
    let mut server = FakeServer::start().await;
    let client = connected(&server.url).await;

    let subscription = client.subscribe("bars", x()).unwrap();
    let (_, frame) = server.next_frame().await;
    assert_eq!(frame.kind, "bars.subscribe");
    assert_eq!(frame.payload, x());

    let topic = subscription.topic().clone();
    wait_until(|| client.topic_state(&topic) == Some(TopicState::Confirmed)).await;
    assert_eq!(client.tracked_topics(), vec![topic]);

    client.shutdown().await;
    assert_eq!(client.status(), ConnectionStatus::Disconnected);
}

#[tokio::test]
async fn test_updates_are_routed_by_topic() {
    let mut server = FakeServer::start().await;
    let client = connected(&server.url).await;

    let mut sub_x = client.subscribe("bars", x()).unwrap();
    let mut sub_y = client.subscribe("bars", y()).unwrap();
    server.next_frame().await;
    server.next_frame().await;

    server.send(Envelope::update(sub_x.topic(), json!({"close": 1})));
    server.send(Envelope::update(sub_y.topic(), json!({"close": 2})));

    let got_x = tokio::time::timeout(WAIT, sub_x.next()).await.unwrap();
    let got_y = tokio::time::timeout(WAIT, sub_y.next()).await.unwrap();
    assert_eq!(got_x, Some(ClientEvent::Update(json!({"close": 1}))));
    assert_eq!(got_y, Some(ClientEvent::Update(json!({"close": 2}))));

    client.shutdown().await;
}

#[tokio::test]
async fn test_second_listener_shares_the_wire_subscription() {
    let mut server = FakeServer::start().await;
    let client = connected(&server.url).await;

    let mut first = client.subscribe("bars", x()).unwrap();
    let mut second = client
        .subscribe("bars", json!({"resolution": "1", "symbol": "AAPL"}))
        .unwrap();
    assert_eq!(first.topic(), second.topic());

    server.next_frame().await;
    assert!(server.drain(Duration::from_millis(100)).await.is_empty());

    server.send(Envelope::update(first.topic(), json!({"close": 3})));
    for sub in [&mut first, &mut second] {
        let event = tokio::time::timeout(WAIT, sub.next()).await.unwrap();
        assert_eq!(event, Some(ClientEvent::Update(json!({"close": 3}))));
    }

    client.shutdown().await;
}

#[tokio::test]
async fn test_rejected_subscription_is_untracked() {
    let mut server = FakeServer::start().await;
    let client = connected(&server.url).await;

    let mut subscription = client.subscribe("rejected", x()).unwrap();
    server.next_frame().await;

    let event = tokio::time::timeout(WAIT, subscription.next()).await.unwrap();
    assert_eq!(event, Some(ClientEvent::Rejected("not allowed".to_string())));
    assert_eq!(client.topic_state(subscription.topic()), None);
    assert_eq!(tokio::time::timeout(WAIT, subscription.next()).await.unwrap(), None);

    client.shutdown().await;
}

#[tokio::test]
async fn test_topic_failure_is_reported_once() {
    let mut server = FakeServer::start().await;
    let client = connected(&server.url).await;

    let mut subscription = client.subscribe("bars", x()).unwrap();
    server.next_frame().await;
    server.send(Envelope::error(subscription.topic(), "producer failed"));

    let event = tokio::time::timeout(WAIT, subscription.next()).await.unwrap();
    assert_eq!(event, Some(ClientEvent::Failed("producer failed".to_string())));
    assert!(client.tracked_topics().is_empty());

    client.shutdown().await;
}

#[tokio::test]
async fn test_invalid_params_are_rejected_locally() {
    let server = FakeServer::start().await;
    let client = connected(&server.url).await;

    let result = client.subscribe("bars", json!({"symbol": ["AAPL"]}));
    assert!(matches!(result, Err(EngineError::InvalidParameter { .. })));
    assert!(client.tracked_topics().is_empty());

    client.shutdown().await;
}

#[tokio::test]
async fn test_unsubscribe_sends_frame_when_connected() {
    let mut server = FakeServer::start().await;
    let client = connected(&server.url).await;

    let subscription = client.subscribe("bars", x()).unwrap();
    server.next_frame().await;

    assert!(client.unsubscribe("bars", x()).unwrap());
    let (_, frame) = server.next_frame().await;
    assert_eq!(frame.kind, "bars.unsubscribe");
    assert_eq!(client.topic_state(subscription.topic()), None);

    assert!(!client.unsubscribe("bars", x()).unwrap());
    client.shutdown().await;
}

#[tokio::test]
async fn test_reconnect_replays_tracked_topics_once() {
    let mut server = FakeServer::start().await;
    let client = connected(&server.url).await;

    let sub_x = client.subscribe("bars", x()).unwrap();
    let sub_y = client.subscribe("bars", y()).unwrap();
    server.next_frame().await;
    server.next_frame().await;
    wait_until(|| {
        client.topic_state(sub_x.topic()) == Some(TopicState::Confirmed)
            && client.topic_state(sub_y.topic()) == Some(TopicState::Confirmed)
    })
    .await;

    // the next connection is held back until Y has been dropped
    server.drop_connection();
    wait_until(|| client.status() != ConnectionStatus::Connected).await;
    assert_eq!(client.topic_state(sub_x.topic()), Some(TopicState::Requested));

    assert!(client.unsubscribe("bars", y()).unwrap());
    server.allow_accept();

    let replayed = server.drain(Duration::from_millis(500)).await;
    assert_eq!(replayed.len(), 1, "replayed: {replayed:?}");
    let (connection, frame) = &replayed[0];
    assert_eq!(*connection, 1);
    assert_eq!(frame.kind, "bars.subscribe");
    assert_eq!(
        encode_json("bars", &frame.payload).unwrap(),
        *sub_x.topic()
    );

    assert_eq!(client.status(), ConnectionStatus::Connected);
    wait_until(|| client.topic_state(sub_x.topic()) == Some(TopicState::Confirmed)).await;
    assert_eq!(client.tracked_topics(), vec![sub_x.topic().clone()]);

    client.shutdown().await;
}

#[tokio::test]
async fn test_subscribe_while_disconnected_is_sent_on_connect() {
    let mut server = FakeServer::start().await;
    let client = connected(&server.url).await;

    server.drop_connection();
    wait_until(|| client.status() != ConnectionStatus::Connected).await;

    let subscription = client.subscribe("bars", x()).unwrap();
    assert_eq!(client.topic_state(subscription.topic()), Some(TopicState::Requested));

    server.allow_accept();
    let (connection, frame) = server.next_frame().await;
    assert_eq!(connection, 1);
    assert_eq!(frame.kind, "bars.subscribe");
    assert!(server.drain(Duration::from_millis(200)).await.is_empty());

    client.shutdown().await;
}

#[tokio::test]
async fn test_gives_up_after_max_retries() {
    let url = unused_url().await;
    let client = ClientConnection::connect(ClientSettings {
        max_retries: Some(2),
        base_delay_ms: 10,
        ..settings(&url)
    });

    tokio::time::timeout(WAIT, client.wait_for_status(ConnectionStatus::Disconnected))
        .await
        .expect("client kept retrying")
        .unwrap();
    assert!(matches!(
        client.subscribe("bars", x()),
        Err(EngineError::ClientClosed)
    ));
}

#[tokio::test]
async fn test_shutdown_cancels_reconnect_backoff() {
    let url = unused_url().await;
    let client = ClientConnection::connect(ClientSettings {
        base_delay_ms: 10_000,
        max_delay_ms: 10_000,
        ..settings(&url)
    });
    let subscription = client.subscribe("bars", x()).unwrap();

    wait_until(|| client.status() == ConnectionStatus::Reconnecting).await;
    tokio::time::timeout(Duration::from_secs(1), client.shutdown())
        .await
        .expect("shutdown waited for the backoff");

    assert_eq!(client.status(), ConnectionStatus::Disconnected);
    assert!(client.tracked_topics().is_empty());
    drop(subscription);
}

#[tokio::test]
async fn test_missed_heartbeat_triggers_reconnect() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    // accepts the handshake, then never reads, so pings go unanswered
    let server = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            if let Ok(ws) = accept_async(stream).await {
                held.push(ws);
            }
        }
    });

    let client = ClientConnection::connect(ClientSettings {
        heartbeat_interval_ms: 100,
        base_delay_ms: 1_000,
        max_delay_ms: 1_000,
        ..settings(&url)
    });
    tokio::time::timeout(WAIT, client.wait_for_status(ConnectionStatus::Connected))
        .await
        .unwrap()
        .unwrap();
    tokio::time::timeout(WAIT, client.wait_for_status(ConnectionStatus::Reconnecting))
        .await
        .expect("silent server was not detected")
        .unwrap();

    client.shutdown().await;
    server.abort();
}

#[tokio::test]
async fn test_ack_for_a_withdrawn_request_does_not_confirm_the_newer_one() {
    let mut server = FakeServer::start().await;
    let client = connected(&server.url).await;
    let params = json!({"account": "A1"});

    let first = client.subscribe("manual", params.clone()).unwrap();
    let topic = first.topic().clone();
    assert!(client.unsubscribe("manual", params.clone()).unwrap());
    let mut second = client.subscribe("manual", params).unwrap();

    let mut kinds = Vec::new();
    for _ in 0..3 {
        kinds.push(server.next_frame().await.1.kind);
    }
    assert_eq!(kinds, ["manual.subscribe", "manual.unsubscribe", "manual.subscribe"]);

    // the ack answering the first request, then an update behind it
    server.send(Envelope::subscribe_ok(&topic));
    server.send(Envelope::update(&topic, json!({"seq": 1})));
    let update = tokio::time::timeout(WAIT, second.next()).await.unwrap();
    assert_eq!(update, Some(ClientEvent::Update(json!({"seq": 1}))));
    assert_eq!(client.topic_state(&topic), Some(TopicState::Requested));

    server.send(Envelope::subscribe_ok(&topic));
    wait_until(|| client.topic_state(&topic) == Some(TopicState::Confirmed)).await;

    client.shutdown().await;
}
