//! Server error type.

use netengine_config::ConfigError;
use netengine_net::{CodecError, ConnectionId, RouteError, TransportError};

/// Failures returned by [`Server`](crate::Server) operations.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("server is already running")]
    AlreadyRunning,

    #[error("server is not running")]
    NotRunning,

    /// The id is in neither pool (and, where relevant, not connected).
    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),

    #[error("no authenticated client named {0:?}")]
    UnknownIdentifier(String),

    /// Another authenticated client already uses this identifier.
    #[error("identifier {0:?} is already taken")]
    DuplicateIdentifier(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Route(#[from] RouteError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}
