//! Collaborative ER-diagram sync engine.
//!
//! Several clients co-edit one diagram over a STOMP broker. Each client keeps
//! an optimistic local copy, filters echoes of its own traffic, coalesces drag
//! gestures into single position commits, and resolves which side of an entity
//! each connector attaches to.
//!
//! Start with [`client::SyncClient::spawn`]; the lower layers are public for
//! callers that want to drive them directly.

pub mod bootstrap;
pub mod client;
pub mod config;
pub mod connection;
pub mod drag;
pub mod engine;
pub mod geometry;
pub mod model;
pub mod mutation;
pub mod protocol;
pub mod stomp;

pub use client::{ClientCommand, ClientEvent, ClientHandle, DiagramView, SyncClient};
pub use config::SyncConfig;
