//! Per-connection dispatch of client messages.
//!
//! A `Session` is created when a socket is accepted and lives until the socket
//! closes. It resolves each inbound envelope to an operation on the engine's
//! connection manager; malformed input is logged and dropped, never fatal.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, error, warn};

use crate::broker::connection::{ConnectionId, SubscribeOutcome};
use crate::broker::outbox::Outbox;
use crate::broker::Engine;
use crate::topic::{Topic, encode_json};
use crate::transport::message::{Envelope, Operation};
use crate::utils::error::{EngineError, Result};

pub struct Session {
    engine: Arc<Engine>,
    id: ConnectionId,
    outbox: Arc<Outbox>,
}

impl Session {
    /// Registers a new connection with the engine.
    pub fn open(engine: Arc<Engine>) -> Self {
        let (id, outbox) = engine.connections().open();
        Self { engine, id, outbox }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn outbox(&self) -> &Arc<Outbox> {
        &self.outbox
    }

    /// Handles one text frame from the client.
    pub async fn handle_text(&self, text: &str) {
        if let Err(e) = self.dispatch(text).await {
            warn!(conn = %self.id, "invalid client message: {e} | {text}");
        }
    }

    async fn dispatch(&self, text: &str) -> Result<()> {
        let envelope = Envelope::from_text(text)?;
        let kind = envelope.message_type()?;

        match kind.op {
            Operation::Subscribe => self.subscribe(&kind.route, &envelope.payload).await,
            Operation::Unsubscribe => self.unsubscribe(&kind.route, &envelope.payload).await,
            op => Err(EngineError::protocol(format!(
                "'{op}' is a server-side operation"
            ))),
        }
    }

    async fn subscribe(&self, route: &str, params: &Value) -> Result<()> {
        if !self.engine.has_route(route) {
            let topic = encode_json(route, params).ok();
            self.reject(route, topic.as_ref(), format!("unknown route '{route}'"));
            return Ok(());
        }

        // rejected before anything is recorded for the connection
        let topic = match encode_json(route, params) {
            Ok(topic) => topic,
            Err(e) => {
                self.reject(route, None, e.to_string());
                return Ok(());
            }
        };

        let outcome = self
            .engine
            .connections()
            .subscribe(&self.id, &topic)
            .await?;
        if outcome == SubscribeOutcome::Cancelled {
            self.reject(route, Some(&topic), "subscription cancelled");
        }
        debug!(conn = %self.id, topic = %topic, ?outcome, "subscribe handled");
        Ok(())
    }

    async fn unsubscribe(&self, route: &str, params: &Value) -> Result<()> {
        if !self.engine.has_route(route) {
            return Err(EngineError::UnknownRoute(route.to_string()));
        }
        let topic = encode_json(route, params)?;
        let removed = self.engine.connections().unsubscribe(&self.id, &topic).await;
        debug!(conn = %self.id, topic = %topic, removed, "unsubscribe handled");
        Ok(())
    }

    fn reject(&self, route: &str, topic: Option<&Topic>, message: impl Into<String>) {
        let message = message.into();
        debug!(conn = %self.id, route, "subscribe rejected: {message}");
        match Envelope::subscribe_error(route, topic, message).to_ws() {
            Ok(msg) => {
                self.outbox.push_control(msg);
            }
            Err(e) => error!(conn = %self.id, "failed to serialize rejection: {e}"),
        }
    }

    /// Releases every topic the connection held. Returns the number of
    /// registry decrements performed.
    pub async fn close(self) -> usize {
        self.engine.connections().close(&self.id).await
    }
}
