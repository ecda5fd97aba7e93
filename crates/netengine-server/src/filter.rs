//! Inbound message filters.
//!
//! Filters run in attach order on every decoded message before dispatch.
//! The first [`Verdict::Reject`] drops the message; later filters and the
//! handler never see it. Dropping is silent towards the sender.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use netengine_net::IncomingMessage;

use crate::server::Server;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Reject,
}

/// Handle returned by [`Server::attach_filter`], used to detach it again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FilterId(u64);

/// A predicate over inbound messages with read access to the server.
pub trait Filter: Send + Sync {
    fn filter(&self, server: &Server, incoming: &IncomingMessage) -> Verdict;

    /// Shown in logs when this filter rejects a message.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

impl<F> Filter for F
where
    F: Fn(&Server, &IncomingMessage) -> Verdict + Send + Sync,
{
    fn filter(&self, server: &Server, incoming: &IncomingMessage) -> Verdict {
        self(server, incoming)
    }

    fn name(&self) -> &str {
        "closure"
    }
}

/// Rejects messages that need authentication from connections that lack
/// it, while the server has authentication set as mandatory.
#[derive(Debug, Default, Clone, Copy)]
pub struct AuthenticationFilter;

impl Filter for AuthenticationFilter {
    fn filter(&self, server: &Server, incoming: &IncomingMessage) -> Verdict {
        if server.authentication_mandatory()
            && incoming.kind().requires_authentication()
            && !server.is_authenticated(incoming.connection_id)
        {
            Verdict::Reject
        } else {
            Verdict::Accept
        }
    }

    fn name(&self) -> &str {
        "authentication"
    }
}

/// Identifies the filter that rejected a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub filter: FilterId,
    pub name: String,
}

#[derive(Default)]
pub(crate) struct FilterChain {
    filters: RwLock<Vec<(FilterId, Arc<dyn Filter>)>>,
    next_id: AtomicU64,
}

impl FilterChain {
    pub(crate) fn attach(&self, filter: Arc<dyn Filter>) -> FilterId {
        let id = FilterId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.filters
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, filter));
        id
    }

    pub(crate) fn detach(&self, id: FilterId) -> bool {
        let mut filters = self.filters.write().unwrap_or_else(PoisonError::into_inner);
        let before = filters.len();
        filters.retain(|(fid, _)| *fid != id);
        filters.len() != before
    }

    pub(crate) fn len(&self) -> usize {
        self.filters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Run the chain, stopping at the first rejection.
    pub(crate) fn evaluate(&self, server: &Server, incoming: &IncomingMessage) -> Result<(), Rejection> {
        // Snapshot so filters may attach or detach filters themselves.
        let filters = self
            .filters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        for (id, filter) in &filters {
            if filter.filter(server, incoming) == Verdict::Reject {
                return Err(Rejection {
                    filter: *id,
                    name: filter.name().to_string(),
                });
            }
        }
        Ok(())
    }
}
