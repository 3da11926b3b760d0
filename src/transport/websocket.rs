use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::{WebSocketStream, accept_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tungstenite::protocol::Message as WsMessage;

use crate::broker::Engine;
use crate::broker::outbox::Outbox;
use crate::config::{ConnectionSettings, Settings};
use crate::transport::session::Session;
use crate::utils::error::Result;

type WsSink = SplitSink<WebSocketStream<TcpStream>, WsMessage>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// Binds `server.host:server.port` and serves until `shutdown` is cancelled.
pub async fn start_websocket_server(
    engine: Arc<Engine>,
    settings: &Settings,
    shutdown: CancellationToken,
) -> Result<()> {
    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    let listener = TcpListener::bind(&addr).await?;
    serve(listener, engine, settings.connection.clone(), shutdown).await
}

/// Accepts WebSocket connections on `listener`. Each connection gets a reader
/// loop and a writer task; the engine is shared by all of them.
pub async fn serve(
    listener: TcpListener,
    engine: Arc<Engine>,
    settings: ConnectionSettings,
    shutdown: CancellationToken,
) -> Result<()> {
    info!("WebSocket server listening on ws://{}", listener.local_addr()?);

    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    connections.spawn(handle_connection(
                        stream,
                        peer,
                        engine.clone(),
                        settings.clone(),
                        shutdown.child_token(),
                    ));
                }
                Err(e) => {
                    warn!("failed to accept connection: {e}");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            },
        }
    }

    info!(open = connections.len(), "WebSocket server stopping");
    while connections.join_next().await.is_some() {}
    Ok(())
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    engine: Arc<Engine>,
    settings: ConnectionSettings,
    closing: CancellationToken,
) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(%peer, "WebSocket handshake error: {e}");
            return;
        }
    };

    let (ws_sender, mut ws_receiver) = ws_stream.split();
    let session = Session::open(engine);
    let id = session.id().to_string();
    info!(conn = %id, %peer, "client connected");

    let writer = tokio::spawn(write_loop(
        ws_sender,
        session.outbox().clone(),
        settings.heartbeat_interval() / 2,
        closing.clone(),
        id.clone(),
    ));

    let reason = read_loop(&session, &mut ws_receiver, &settings, &closing).await;

    // same teardown for every kind of disconnect
    closing.cancel();
    let released = session.close().await;
    if let Err(e) = writer.await {
        error!(conn = %id, "writer task failed: {e}");
    }
    info!(conn = %id, reason, released, "client disconnected");
}

enum ReadEvent {
    Frame(WsMessage),
    Ended,
    Idle,
    Failed(tungstenite::Error),
}

async fn next_event(receiver: &mut WsSource, idle_after: Duration) -> ReadEvent {
    let next = receiver.next();
    let frame = if idle_after.is_zero() {
        next.await
    } else {
        match tokio::time::timeout(idle_after, next).await {
            Ok(frame) => frame,
            Err(_) => return ReadEvent::Idle,
        }
    };
    match frame {
        Some(Ok(msg)) => ReadEvent::Frame(msg),
        Some(Err(e)) => ReadEvent::Failed(e),
        None => ReadEvent::Ended,
    }
}

/// Runs until the connection should be torn down and returns why.
async fn read_loop(
    session: &Session,
    receiver: &mut WsSource,
    settings: &ConnectionSettings,
    closing: &CancellationToken,
) -> &'static str {
    let idle_after = settings.heartbeat_interval();
    let lifetime = async {
        match settings.max_connection_lifetime() {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(lifetime);

    loop {
        // message handling stays outside the select so a subscribe is never
        // abandoned halfway
        let event = tokio::select! {
            biased;
            _ = closing.cancelled() => return "closed by server",
            _ = &mut lifetime => return "max lifetime reached",
            event = next_event(receiver, idle_after) => event,
        };

        match event {
            ReadEvent::Frame(WsMessage::Text(text)) => session.handle_text(text.as_str()).await,
            ReadEvent::Frame(WsMessage::Close(_)) | ReadEvent::Ended => return "closed by client",
            ReadEvent::Frame(WsMessage::Binary(_)) => {
                warn!(conn = %session.id(), "binary frames are not supported, ignoring");
            }
            // ping, pong and raw frames only count as activity
            ReadEvent::Frame(_) => {}
            ReadEvent::Idle => return "heartbeat timeout",
            ReadEvent::Failed(e) => {
                debug!(conn = %session.id(), "read failed: {e}");
                return "transport error";
            }
        }
    }
}

async fn write_loop(
    mut ws_sender: WsSink,
    outbox: Arc<Outbox>,
    ping_every: Duration,
    closing: CancellationToken,
    id: String,
) {
    let keepalive_enabled = !ping_every.is_zero();
    let mut keepalive = tokio::time::interval(ping_every.max(Duration::from_millis(1)));
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
    keepalive.reset();

    loop {
        let outbound = tokio::select! {
            biased;
            _ = closing.cancelled() => break,
            msg = outbox.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
            _ = keepalive.tick(), if keepalive_enabled => WsMessage::Ping(Default::default()),
        };

        if let Err(e) = ws_sender.send(outbound).await {
            // a failed write is treated as a disconnect of this connection only
            warn!(conn = %id, "failed to send message: {e}");
            closing.cancel();
            break;
        }
    }

    let _ = ws_sender.close().await;
    debug!(conn = %id, dropped = outbox.dropped(), "send loop closed");
}
