//! Client lifecycle notifications, delivered like the server's.

use std::sync::{Mutex, PoisonError};

use crossbeam_channel::{Receiver, Sender};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientEvent {
    Starting,
    /// The transport reached the server.
    ConnectedToServer,
    /// The poll loop is running.
    Ready,
    /// The server closed the connection or it failed.
    Disconnected,
    Stopping,
    Stopped,
}

#[derive(Default)]
pub(crate) struct EventBus {
    subscribers: Mutex<Vec<Sender<ClientEvent>>>,
}

impl EventBus {
    pub(crate) fn subscribe(&self) -> Receiver<ClientEvent> {
        let (tx, rx) = crossbeam_channel::unbounded();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    pub(crate) fn emit(&self, event: ClientEvent) {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|tx| tx.send(event).is_ok());
    }
}
