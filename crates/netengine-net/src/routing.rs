//! Message routing: one handler per [`MessageKind`].
//!
//! [`MessageRouter`] is generic over the context handed to handlers, so the
//! server passes itself and the client passes itself. Registration goes
//! through `&self`; handlers can be attached while traffic is flowing.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::messages::{IncomingMessage, MessageKind};

/// Routing failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    /// A message arrived for a kind nobody handles.
    #[error("no handler registered for {0}")]
    NoHandler(MessageKind),

    /// A second handler was offered for an already-handled kind.
    #[error("a handler for {0} is already registered")]
    DuplicateHandler(MessageKind),
}

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

/// Processes messages of one kind.
pub trait MessageHandler<C: ?Sized>: Send + Sync {
    fn handle(&self, ctx: &C, incoming: IncomingMessage);
}

/// Blanket implementation for closures.
impl<C: ?Sized, F> MessageHandler<C> for F
where
    F: Fn(&C, IncomingMessage) + Send + Sync,
{
    fn handle(&self, ctx: &C, incoming: IncomingMessage) {
        self(ctx, incoming);
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Maps each [`MessageKind`] to exactly one handler.
pub struct MessageRouter<C: ?Sized> {
    handlers: RwLock<HashMap<MessageKind, Arc<dyn MessageHandler<C>>>>,
}

impl<C: ?Sized> MessageRouter<C> {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Register `handler` for `kind`.
    ///
    /// Fails if `kind` already has a handler; the existing one stays.
    pub fn attach_handler<H>(&self, kind: MessageKind, handler: H) -> Result<(), RouteError>
    where
        H: MessageHandler<C> + 'static,
    {
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        if handlers.contains_key(&kind) {
            return Err(RouteError::DuplicateHandler(kind));
        }
        handlers.insert(kind, Arc::new(handler));
        tracing::debug!(%kind, "handler attached");
        Ok(())
    }

    pub fn detach_all_handlers(&self) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Kinds with a handler, in discriminator order.
    pub fn registered_kinds(&self) -> Vec<MessageKind> {
        let mut kinds: Vec<_> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect();
        kinds.sort();
        kinds
    }

    pub fn has_handler(&self, kind: MessageKind) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&kind)
    }

    /// Run the handler for `incoming`'s kind on the calling thread.
    pub fn dispatch(&self, ctx: &C, incoming: IncomingMessage) -> Result<(), RouteError> {
        let kind = incoming.kind();
        // Released before the call so a handler may attach handlers itself.
        let handler = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .cloned()
            .ok_or(RouteError::NoHandler(kind))?;
        handler.handle(ctx, incoming);
        Ok(())
    }
}

impl<C: ?Sized> Default for MessageRouter<C> {
    fn default() -> Self {
        Self::new()
    }
}
