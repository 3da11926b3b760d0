//! The `error` module defines the error types used within `streamhub`.
//!
//! Failures are always scoped: a bad parameter rejects one subscribe request,
//! a producer failure affects one topic, a transport failure closes one
//! connection. Nothing here is meant to bring the process down.

use thiserror::Error;

/// Engine-wide error type.
#[derive(Error, Debug)]
pub enum EngineError {
    /// A subscription parameter could not be encoded into a topic.
    #[error("invalid parameter '{key}': {reason}")]
    InvalidParameter { key: String, reason: String },

    #[error("invalid route name '{0}'")]
    InvalidRoute(String),

    #[error("unknown route '{0}'")]
    UnknownRoute(String),

    #[error("malformed topic '{0}'")]
    MalformedTopic(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("unknown connection '{0}'")]
    UnknownConnection(String),

    #[error("client connection is shut down")]
    ClientClosed,

    #[error("websocket error: {0}")]
    Transport(#[from] tungstenite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    pub fn invalid_parameter(key: impl Into<String>, reason: impl Into<String>) -> Self {
        EngineError::InvalidParameter {
            key: key.into(),
            reason: reason.into(),
        }
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        EngineError::Protocol(msg.into())
    }
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Failure reported by a data source while producing a value for a topic.
///
/// Source errors never leave the producer manager; they are retried and, once
/// retries are exhausted, reported to the topic's subscribers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct SourceError(pub String);

impl SourceError {
    pub fn new(msg: impl Into<String>) -> Self {
        SourceError(msg.into())
    }
}
