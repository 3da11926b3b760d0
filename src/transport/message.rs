//! Wire protocol
//!
//! Every frame is a JSON text message shaped as
//! `{"type": "<route>.<operation>", "payload": ...}`. Server pushes for a
//! topic (`update`, `error`) also carry a top-level `topic` so a client that
//! multiplexes many subscriptions over one socket can route them.
//!
//! Subscribe and unsubscribe requests carry the raw parameter object; both
//! sides derive the topic string themselves with the topic codec.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tungstenite::protocol::Message as WsMessage;

use crate::topic::Topic;
use crate::utils::error::{EngineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Subscribe,
    Unsubscribe,
    SubscribeResponse,
    Update,
    Error,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Subscribe => "subscribe",
            Operation::Unsubscribe => "unsubscribe",
            Operation::SubscribeResponse => "subscribe.response",
            Operation::Update => "update",
            Operation::Error => "error",
        }
    }
}

impl FromStr for Operation {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "subscribe" => Ok(Operation::Subscribe),
            "unsubscribe" => Ok(Operation::Unsubscribe),
            "subscribe.response" => Ok(Operation::SubscribeResponse),
            "update" => Ok(Operation::Update),
            "error" => Ok(Operation::Error),
            other => Err(EngineError::protocol(format!("unknown operation '{other}'"))),
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parsed `type` field: the route is everything before the first `.`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageType {
    pub route: String,
    pub op: Operation,
}

impl MessageType {
    pub fn new(route: impl Into<String>, op: Operation) -> Self {
        Self {
            route: route.into(),
            op,
        }
    }
}

impl FromStr for MessageType {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        let (route, op) = s
            .split_once('.')
            .ok_or_else(|| EngineError::protocol(format!("malformed message type '{s}'")))?;
        if route.is_empty() {
            return Err(EngineError::protocol(format!("missing route in '{s}'")));
        }
        Ok(Self::new(route, op.parse()?))
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.route, self.op)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckStatus {
    Ok,
    Error,
}

/// Payload of `<route>.subscribe.response`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeResponse {
    pub status: AckStatus,
    pub topic: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
}

impl Envelope {
    pub fn new(kind: &MessageType, payload: Value) -> Self {
        Self {
            kind: kind.to_string(),
            payload,
            topic: None,
        }
    }

    pub fn subscribe(route: &str, params: Value) -> Self {
        Self::new(&MessageType::new(route, Operation::Subscribe), params)
    }

    pub fn unsubscribe(route: &str, params: Value) -> Self {
        Self::new(&MessageType::new(route, Operation::Unsubscribe), params)
    }

    pub fn subscribe_ok(topic: &Topic) -> Self {
        Self::subscribe_response(
            topic.route(),
            SubscribeResponse {
                status: AckStatus::Ok,
                topic: Some(topic.to_string()),
                message: None,
            },
        )
    }

    pub fn subscribe_error(route: &str, topic: Option<&Topic>, message: impl Into<String>) -> Self {
        Self::subscribe_response(
            route,
            SubscribeResponse {
                status: AckStatus::Error,
                topic: topic.map(Topic::to_string),
                message: Some(message.into()),
            },
        )
    }

    fn subscribe_response(route: &str, response: SubscribeResponse) -> Self {
        let payload = json!({
            "status": response.status,
            "topic": response.topic,
        });
        let mut envelope = Self::new(
            &MessageType::new(route, Operation::SubscribeResponse),
            payload,
        );
        if let (Some(message), Value::Object(map)) = (response.message, &mut envelope.payload) {
            map.insert("message".to_string(), Value::String(message));
        }
        envelope
    }

    pub fn update(topic: &Topic, payload: Value) -> Self {
        Self {
            topic: Some(topic.to_string()),
            ..Self::new(&MessageType::new(topic.route(), Operation::Update), payload)
        }
    }

    pub fn error(topic: &Topic, message: &str) -> Self {
        Self {
            topic: Some(topic.to_string()),
            ..Self::new(
                &MessageType::new(topic.route(), Operation::Error),
                json!({ "message": message }),
            )
        }
    }

    pub fn message_type(&self) -> Result<MessageType> {
        self.kind.parse()
    }

    /// Decodes the payload of a `subscribe.response`.
    pub fn subscribe_response_payload(&self) -> Result<SubscribeResponse> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    pub fn from_text(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_text(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn to_ws(&self) -> Result<WsMessage> {
        Ok(WsMessage::text(self.to_text()?))
    }
}
