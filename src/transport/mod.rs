//! The `transport` module is responsible for handling network communication
//! with clients via WebSockets.
//!
//! It defines the wire envelope shared with clients, dispatches inbound
//! requests to the engine (`session`) and runs the WebSocket server itself:
//! accepting sockets, draining each connection's outbox, heartbeats and the
//! connection lifetime limit.

pub mod message;
pub mod session;
pub mod websocket;
