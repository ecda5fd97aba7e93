//! Errors surfaced by the transport to its callers.

use std::time::Duration;

use crate::packet::ConnectionId;
use crate::tls::TlsError;

/// Failures of transport operations.
///
/// Errors inside connection tasks never reach callers this way; they are
/// logged and turned into a `Disconnection` packet instead.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The outbound dial did not complete in time.
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// The target connection is not (or no longer) open.
    #[error("connection {0} is not connected")]
    LostConnection(ConnectionId),

    /// The payload exceeds the configured maximum message size.
    #[error("message of {size} bytes exceeds the {max} byte limit")]
    OversizedMessage {
        /// Payload size in bytes.
        size: usize,
        /// Configured maximum.
        max: u32,
    },

    /// The TLS handshake failed or produced an unacceptable session.
    #[error("TLS handshake failed: {0}")]
    TlsHandshakeFailed(String),

    /// TLS material could not be loaded.
    #[error(transparent)]
    TlsConfig(#[from] TlsError),

    /// Socket-level failure (bind, connect, ...).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
