//! Relay core: a transparent real-time relay for end-to-end-encrypted
//! client payloads.
//!
//! Clients register under a stable identity, open a persistent
//! bidirectional session, and submit opaque payloads addressed to other
//! identities. The relay delivers immediately when the recipient is
//! online and queues with a bounded TTL otherwise. It never interprets
//! payload bytes — encryption, key exchange, and account persistence
//! live entirely on the client and in the external account store.
//!
//! This crate is split into a library (the dispatcher and its
//! collaborators, independently testable against in-memory fakes) and a
//! thin binary (`src/main.rs`) that wires the library up to Redis,
//! Postgres, and an axum HTTP/WebSocket listener.

pub mod accountstore;
pub mod config;
pub mod error;
pub mod handler;
pub mod pairing;
pub mod presence;
pub mod protocol;
pub mod pubsub;
pub mod queue;
pub mod ratelimit;
pub mod safety;
pub mod session;
pub mod state;
