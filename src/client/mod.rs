//! The `client` module is the consumer side of the protocol.
//!
//! `ClientConnection` keeps one WebSocket open to a server, multiplexes any
//! number of topic subscriptions over it and transparently reconnects,
//! replaying every tracked subscription exactly once.

pub mod pubsub_client;
pub use pubsub_client::{ClientConnection, ClientEvent, ConnectionStatus, Subscription, TopicState};

#[cfg(test)]
mod tests;
