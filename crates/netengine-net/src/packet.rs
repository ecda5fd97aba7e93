//! Units exchanged between the transport and whoever drains it.

use std::sync::atomic::{AtomicU64, Ordering};

/// Identifier of one accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Monotonic [`ConnectionId`] source.
///
/// Each transport owns one generator, so ids are unique per transport
/// instance and never handed out twice, even after the connection closes.
#[derive(Debug)]
pub struct IdGenerator {
    next: AtomicU64,
}

impl IdGenerator {
    /// Create a generator whose first id is 1.
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> ConnectionId {
        ConnectionId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// What a [`Packet`] reports about its connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    /// The connection is established and ready for traffic.
    Connection,
    /// One complete frame arrived.
    Data,
    /// The connection is gone; emitted exactly once per connection.
    Disconnection,
}

/// Immutable record pushed onto the inbound queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub connection_id: ConnectionId,
    pub kind: PacketKind,
    /// Frame payload; empty unless `kind` is [`PacketKind::Data`].
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn connection(connection_id: ConnectionId) -> Self {
        Self {
            connection_id,
            kind: PacketKind::Connection,
            payload: Vec::new(),
        }
    }

    pub fn data(connection_id: ConnectionId, payload: Vec<u8>) -> Self {
        Self {
            connection_id,
            kind: PacketKind::Data,
            payload,
        }
    }

    pub fn disconnection(connection_id: ConnectionId) -> Self {
        Self {
            connection_id,
            kind: PacketKind::Disconnection,
            payload: Vec::new(),
        }
    }
}
