//! Server lifecycle notifications.
//!
//! Every subscriber gets its own unbounded channel and sees every event in
//! emission order. Subscribers that drop their receiver are pruned on the
//! next emission.

use std::sync::{Mutex, PoisonError};

use crossbeam_channel::{Receiver, Sender};

use crate::session::Client;

/// Why a client left.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The peer closed the connection or it failed.
    Remote,
    /// The application called `force_disconnect_client`/`force_disconnect_all`.
    Kicked,
    /// The server stopped.
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    Starting,
    Ready,
    Stopping,
    Stopped,
    /// A new connection entered the pending pool.
    ClientConnected(Client),
    /// A pending connection was promoted.
    ClientAuthenticated(Client),
    /// A client left either pool. Emitted at most once per connection.
    ClientDisconnected {
        client: Client,
        reason: DisconnectReason,
    },
    /// A pending connection outlived its TTL and was closed. Emitted instead
    /// of `ClientDisconnected`.
    ClientEvicted(Client),
}

#[derive(Default)]
pub(crate) struct EventBus {
    subscribers: Mutex<Vec<Sender<ServerEvent>>>,
}

impl EventBus {
    pub(crate) fn subscribe(&self) -> Receiver<ServerEvent> {
        let (tx, rx) = crossbeam_channel::unbounded();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    pub(crate) fn emit(&self, event: ServerEvent) {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}
