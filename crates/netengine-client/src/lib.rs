//! High-level NetEngine client.
//!
//! [`GameClient`] dials one server, polls its inbound queue at a fixed
//! rate and dispatches decoded messages to per-kind handlers, mirroring
//! the server's tick loop.

pub mod client;
pub mod error;
pub mod events;

pub use client::{ClientOptions, GameClient};
pub use error::ClientError;
pub use events::ClientEvent;
