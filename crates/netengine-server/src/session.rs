//! Connection lifecycle: the pending and authenticated pools.
//!
//! A connection enters the pending pool when it is accepted and leaves it
//! by promotion, TTL expiry or disconnect. Promotion takes both pool locks
//! (pending, then clients) so no reader ever sees a connection in both.
//! Pending deadlines live in one min-heap swept by the server tick.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::net::SocketAddr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use netengine_net::ConnectionId;

use crate::error::ServerError;

/// A connection as seen by the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Client {
    pub id: ConnectionId,
    pub address: SocketAddr,
    /// Name given at authentication; `None` while pending.
    pub identifier: Option<String>,
    pub authenticated: bool,
}

impl Client {
    fn pending(id: ConnectionId, address: SocketAddr) -> Self {
        Self {
            id,
            address,
            identifier: None,
            authenticated: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Pending pool
// ---------------------------------------------------------------------------

struct PendingEntry {
    client: Client,
    deadline: Instant,
}

/// Unauthenticated connections plus their eviction deadlines.
///
/// Heap entries are not removed eagerly; an entry whose connection is gone
/// or whose deadline no longer matches is skipped when it surfaces.
#[derive(Default)]
struct PendingPool {
    entries: HashMap<ConnectionId, PendingEntry>,
    deadlines: BinaryHeap<Reverse<(Instant, ConnectionId)>>,
}

impl PendingPool {
    fn insert(&mut self, client: Client, deadline: Instant) {
        self.deadlines.push(Reverse((deadline, client.id)));
        self.entries.insert(client.id, PendingEntry { client, deadline });
    }

    fn remove(&mut self, id: ConnectionId) -> Option<Client> {
        let entry = self.entries.remove(&id)?;
        if self.entries.is_empty() {
            self.deadlines.clear();
        }
        Some(entry.client)
    }

    fn get(&self, id: ConnectionId) -> Option<&Client> {
        self.entries.get(&id).map(|e| &e.client)
    }

    fn pop_expired(&mut self, now: Instant) -> Vec<Client> {
        let mut expired = Vec::new();
        while let Some(&Reverse((deadline, id))) = self.deadlines.peek() {
            if deadline > now {
                break;
            }
            self.deadlines.pop();
            if self.entries.get(&id).is_some_and(|e| e.deadline == deadline)
                && let Some(entry) = self.entries.remove(&id)
            {
                expired.push(entry.client);
            }
        }
        expired
    }

    fn drain(&mut self) -> Vec<Client> {
        self.deadlines.clear();
        self.entries.drain().map(|(_, e)| e.client).collect()
    }
}

// ---------------------------------------------------------------------------
// Authenticated pool
// ---------------------------------------------------------------------------

/// Authenticated connections indexed by id and by identifier.
#[derive(Default)]
struct ClientPool {
    by_id: HashMap<ConnectionId, Client>,
    by_identifier: HashMap<String, ConnectionId>,
}

impl ClientPool {
    /// Insert under both indices, or hand the client back if its identifier
    /// is taken. Nothing is modified on failure.
    fn insert(&mut self, client: Client) -> Result<(), Client> {
        let Some(identifier) = client.identifier.clone() else {
            return Err(client);
        };
        if self.by_identifier.contains_key(&identifier) {
            return Err(client);
        }
        self.by_identifier.insert(identifier, client.id);
        self.by_id.insert(client.id, client);
        Ok(())
    }

    fn remove(&mut self, id: ConnectionId) -> Option<Client> {
        let client = self.by_id.remove(&id)?;
        if let Some(identifier) = &client.identifier {
            self.by_identifier.remove(identifier);
        }
        Some(client)
    }

    fn get(&self, id: ConnectionId) -> Option<&Client> {
        self.by_id.get(&id)
    }

    fn get_by_identifier(&self, identifier: &str) -> Option<&Client> {
        self.by_identifier
            .get(identifier)
            .and_then(|id| self.by_id.get(id))
    }

    fn drain(&mut self) -> Vec<Client> {
        self.by_identifier.clear();
        self.by_id.drain().map(|(_, c)| c).collect()
    }
}

// ---------------------------------------------------------------------------
// Session manager
// ---------------------------------------------------------------------------

/// Owns both pools. Every method is safe to call from any thread.
pub struct SessionManager {
    pending: Mutex<PendingPool>,
    clients: Mutex<ClientPool>,
    auth_ttl: Duration,
}

impl SessionManager {
    pub fn new(auth_ttl: Duration) -> Self {
        Self {
            pending: Mutex::new(PendingPool::default()),
            clients: Mutex::new(ClientPool::default()),
            auth_ttl,
        }
    }

    pub fn auth_ttl(&self) -> Duration {
        self.auth_ttl
    }

    fn pending(&self) -> MutexGuard<'_, PendingPool> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn clients(&self) -> MutexGuard<'_, ClientPool> {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a freshly accepted connection as pending, due at `now + ttl`.
    pub fn on_connect(&self, id: ConnectionId, address: SocketAddr, now: Instant) -> Client {
        let client = Client::pending(id, address);
        self.pending().insert(client.clone(), now + self.auth_ttl);
        client
    }

    /// Promote a pending connection under `identifier`.
    ///
    /// On a duplicate identifier the connection stays pending with its
    /// original deadline.
    pub fn authenticate(&self, id: ConnectionId, identifier: String) -> Result<Client, ServerError> {
        let mut pending = self.pending();
        let mut clients = self.clients();

        let entry = pending
            .entries
            .get(&id)
            .ok_or(ServerError::UnknownConnection(id))?;
        if clients.by_identifier.contains_key(&identifier) {
            return Err(ServerError::DuplicateIdentifier(identifier));
        }

        let mut client = entry.client.clone();
        client.identifier = Some(identifier.clone());
        client.authenticated = true;

        clients
            .insert(client.clone())
            .map_err(|_| ServerError::DuplicateIdentifier(identifier))?;
        pending.remove(id);
        Ok(client)
    }

    /// Remove `id` from whichever pool holds it.
    pub fn remove(&self, id: ConnectionId) -> Option<Client> {
        let mut pending = self.pending();
        if let Some(client) = pending.remove(id) {
            return Some(client);
        }
        self.clients().remove(id)
    }

    /// Remove and return every pending connection whose deadline is at or
    /// before `now`. Each one is returned by exactly one call.
    pub fn take_expired(&self, now: Instant) -> Vec<Client> {
        self.pending().pop_expired(now)
    }

    /// Empty both pools.
    pub fn drain_all(&self) -> Vec<Client> {
        let mut pending = self.pending();
        let mut clients = self.clients();
        let mut all = pending.drain();
        all.extend(clients.drain());
        all
    }

    pub fn client(&self, id: ConnectionId) -> Option<Client> {
        self.clients().get(id).cloned()
    }

    pub fn client_by_identifier(&self, identifier: &str) -> Option<Client> {
        self.clients().get_by_identifier(identifier).cloned()
    }

    pub fn clients_snapshot(&self) -> Vec<Client> {
        let mut clients: Vec<_> = self.clients().by_id.values().cloned().collect();
        clients.sort_by_key(|c| c.id);
        clients
    }

    pub fn pending_client(&self, id: ConnectionId) -> Option<Client> {
        self.pending().get(id).cloned()
    }

    pub fn pending_snapshot(&self) -> Vec<Client> {
        let mut clients: Vec<_> = self
            .pending()
            .entries
            .values()
            .map(|e| e.client.clone())
            .collect();
        clients.sort_by_key(|c| c.id);
        clients
    }

    pub fn authenticated_ids(&self) -> Vec<ConnectionId> {
        self.clients().by_id.keys().copied().collect()
    }

    pub fn is_authenticated(&self, id: ConnectionId) -> bool {
        self.clients().by_id.contains_key(&id)
    }

    /// `(pending, authenticated)` pool sizes.
    pub fn counts(&self) -> (usize, usize) {
        let pending = self.pending();
        let clients = self.clients();
        (pending.entries.len(), clients.by_id.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_millis(200);

    fn addr() -> SocketAddr {
        "127.0.0.1:4000".parse().unwrap()
    }

    #[test]
    fn test_connect_creates_pending_client() {
        let sessions = SessionManager::new(TTL);
        let client = sessions.on_connect(ConnectionId(1), addr(), Instant::now());

        assert_eq!(client.id, ConnectionId(1));
        assert!(!client.authenticated);
        assert_eq!(sessions.pending_client(ConnectionId(1)), Some(client));
        assert!(sessions.client(ConnectionId(1)).is_none());
    }

    #[test]
    fn test_authenticate_moves_between_pools() {
        let sessions = SessionManager::new(TTL);
        sessions.on_connect(ConnectionId(1), addr(), Instant::now());

        let client = sessions
            .authenticate(ConnectionId(1), "alice".into())
            .unwrap();
        assert!(client.authenticated);
        assert_eq!(client.identifier.as_deref(), Some("alice"));
        assert!(sessions.pending_client(ConnectionId(1)).is_none());
        assert_eq!(sessions.client(ConnectionId(1)), Some(client.clone()));
        assert_eq!(sessions.client_by_identifier("alice"), Some(client));
        assert_eq!(sessions.counts(), (0, 1));
    }

    #[test]
    fn test_authenticate_unknown_id_fails() {
        let sessions = SessionManager::new(TTL);
        assert!(matches!(
            sessions.authenticate(ConnectionId(5), "bob".into()),
            Err(ServerError::UnknownConnection(ConnectionId(5)))
        ));
    }

    #[test]
    fn test_authenticate_twice_fails() {
        let sessions = SessionManager::new(TTL);
        sessions.on_connect(ConnectionId(1), addr(), Instant::now());
        sessions.authenticate(ConnectionId(1), "alice".into()).unwrap();
        assert!(matches!(
            sessions.authenticate(ConnectionId(1), "alice2".into()),
            Err(ServerError::UnknownConnection(_))
        ));
    }

    #[test]
    fn test_duplicate_identifier_leaves_connection_pending() {
        let sessions = SessionManager::new(TTL);
        let now = Instant::now();
        sessions.on_connect(ConnectionId(1), addr(), now);
        sessions.on_connect(ConnectionId(2), addr(), now);
        sessions.authenticate(ConnectionId(1), "alice".into()).unwrap();

        let result = sessions.authenticate(ConnectionId(2), "alice".into());
        assert!(matches!(result, Err(ServerError::DuplicateIdentifier(name)) if name == "alice"));
        assert!(sessions.pending_client(ConnectionId(2)).is_some());
        assert_eq!(
            sessions.client_by_identifier("alice").unwrap().id,
            ConnectionId(1)
        );

        // Still evicted on its original schedule.
        let expired = sessions.take_expired(now + TTL);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, ConnectionId(2));
    }

    #[test]
    fn test_remove_clears_both_indices() {
        let sessions = SessionManager::new(TTL);
        sessions.on_connect(ConnectionId(1), addr(), Instant::now());
        sessions.authenticate(ConnectionId(1), "alice".into()).unwrap();

        assert!(sessions.remove(ConnectionId(1)).is_some());
        assert!(sessions.remove(ConnectionId(1)).is_none());
        assert!(sessions.client_by_identifier("alice").is_none());

        // The identifier is free again.
        sessions.on_connect(ConnectionId(2), addr(), Instant::now());
        assert!(sessions.authenticate(ConnectionId(2), "alice".into()).is_ok());
    }

    #[test]
    fn test_expiry_is_reported_once() {
        let sessions = SessionManager::new(TTL);
        let now = Instant::now();
        sessions.on_connect(ConnectionId(1), addr(), now);

        assert!(sessions.take_expired(now + TTL / 2).is_empty());
        assert_eq!(sessions.take_expired(now + TTL).len(), 1);
        assert!(sessions.take_expired(now + TTL * 2).is_empty());
        assert!(sessions.pending_client(ConnectionId(1)).is_none());
    }

    #[test]
    fn test_promoted_or_removed_clients_never_expire() {
        let sessions = SessionManager::new(TTL);
        let now = Instant::now();
        sessions.on_connect(ConnectionId(1), addr(), now);
        sessions.on_connect(ConnectionId(2), addr(), now);
        sessions.on_connect(ConnectionId(3), addr(), now);
        sessions.authenticate(ConnectionId(1), "alice".into()).unwrap();
        sessions.remove(ConnectionId(2));

        let expired = sessions.take_expired(now + TTL);
        assert_eq!(
            expired.iter().map(|c| c.id).collect::<Vec<_>>(),
            vec![ConnectionId(3)]
        );
        assert!(sessions.client(ConnectionId(1)).is_some());
    }

    #[test]
    fn test_expiry_follows_deadline_order() {
        let sessions = SessionManager::new(TTL);
        let start = Instant::now();
        sessions.on_connect(ConnectionId(2), addr(), start + Duration::from_millis(50));
        sessions.on_connect(ConnectionId(1), addr(), start);

        let first = sessions.take_expired(start + TTL);
        assert_eq!(first.iter().map(|c| c.id).collect::<Vec<_>>(), vec![ConnectionId(1)]);
        let second = sessions.take_expired(start + TTL + Duration::from_millis(50));
        assert_eq!(second.iter().map(|c| c.id).collect::<Vec<_>>(), vec![ConnectionId(2)]);
    }

    #[test]
    fn test_concurrent_expiry_hands_each_client_out_once() {
        let sessions = std::sync::Arc::new(SessionManager::new(Duration::ZERO));
        let now = Instant::now();
        for i in 0..500 {
            sessions.on_connect(ConnectionId(i), addr(), now);
        }

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let sessions = std::sync::Arc::clone(&sessions);
                std::thread::spawn(move || sessions.take_expired(Instant::now()).len())
            })
            .collect();
        let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, 500);
    }

    #[test]
    fn test_drain_all_empties_both_pools() {
        let sessions = SessionManager::new(TTL);
        sessions.on_connect(ConnectionId(1), addr(), Instant::now());
        sessions.on_connect(ConnectionId(2), addr(), Instant::now());
        sessions.authenticate(ConnectionId(1), "alice".into()).unwrap();

        assert_eq!(sessions.drain_all().len(), 2);
        assert_eq!(sessions.counts(), (0, 0));
        assert!(sessions.take_expired(Instant::now() + TTL).is_empty());
    }
}
