//! Reverse tunneling engine (ngrok/frp style).
//!
//! A public server accepts persistent multiplexed sessions from clients
//! behind NAT. The first stream of a session carries the handshake,
//! registrations and heartbeats; every external connection to a registered
//! public port gets its own server-initiated stream, headed by one
//! `NewStream` record and pumped to a loopback service on the client host.

pub mod client;
pub mod codec;
pub mod flow;
pub mod listener;
pub mod registry;
pub mod server;
pub mod transport;
