//! # streamhub
//!
//! `streamhub` is a topic-based subscription and broadcast engine served over
//! WebSockets. Clients subscribe to parameterized data streams
//! (`bars:{"resolution":"1","symbol":"AAPL"}`); the engine runs exactly one
//! producer per active topic and fans every produced value out to all of the
//! topic's subscribers.
//!
//! ## Core Modules
//!
//! - `topic`: canonical topic encoding shared by server and clients.
//! - `broker`: the `Engine` with its subscription registry, producer manager,
//!   per-route broadcast routers and connection manager.
//! - `transport`: the wire envelope and the WebSocket server.
//! - `client`: a reconnecting consumer-side `ClientConnection`.
//! - `config`: layered configuration (defaults, file, environment).
//! - `utils`: error types, backoff and logging setup.

pub mod broker;
pub mod client;
pub mod config;
pub mod topic;
pub mod transport;
pub mod utils;
