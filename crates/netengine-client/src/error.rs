use netengine_config::ConfigError;
use netengine_net::{CodecError, RouteError, TransportError};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("client is already running")]
    AlreadyRunning,

    #[error("client is not running")]
    NotRunning,

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Route(#[from] RouteError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}
