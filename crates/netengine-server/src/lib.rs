//! Authenticating message server for NetEngine.
//!
//! Connections land in a pending pool and must authenticate within a TTL or
//! be evicted. Decoded messages pass a filter chain, then reach the one
//! handler registered for their kind. All of it runs on a fixed-rate tick.

pub mod error;
pub mod events;
pub mod filter;
pub mod server;
pub mod session;

pub use error::ServerError;
pub use events::{DisconnectReason, ServerEvent};
pub use filter::{AuthenticationFilter, Filter, FilterId, Rejection, Verdict};
pub use server::{Server, ServerOptions, ServerStats};
pub use session::{Client, SessionManager};
