//! Zajel signaling and rendezvous server.
//!
//! Clients connect over WebSocket, register short pairing codes, and are
//! matched to peers directly, through daily meeting points (dead drops),
//! or through hourly live tokens. Once matched, the server relays
//! signaling frames and stays out of the data path. Servers federate via
//! SWIM gossip and a consistent-hash ring that routes rendezvous hashes
//! to their owning server.

pub mod config;
pub mod connection;
pub mod db;
pub mod errors;
pub mod federation;
pub mod identity;
pub mod ratelimit;
pub mod registry;
pub mod server;
pub mod tls;
pub mod web;
