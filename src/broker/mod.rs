//! The `broker` module is the server-side subscription and broadcast engine.
//!
//! - `registry`: per-topic reference counts and lifecycle transitions
//! - `producer`: one cancellable production task per active topic
//! - `source`: the data-source seam and the simulated market sources
//! - `router`: per-route queue and fan-out task
//! - `outbox`: per-connection delivery buffer
//! - `connection`: per-connection pending/confirmed state
//! - `engine`: owns and wires all of the above

pub mod connection;
pub mod engine;
pub mod outbox;
pub mod producer;
pub mod registry;
pub mod router;
pub mod source;

pub use connection::{ConnectionId, ConnectionManager, SubscribeOutcome};
pub use engine::{Engine, EngineBuilder};
pub use registry::{SubscriptionRegistry, TopicLifecycle};
pub use source::DataSource;
