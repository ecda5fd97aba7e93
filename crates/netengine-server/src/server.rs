//! The message server.
//!
//! [`Server`] ties the transport to the session pools, the filter chain and
//! the handler router. A tick task drains the transport at a fixed target
//! rate; everything a tick does (lifecycle bookkeeping, decoding, filters,
//! handlers, eviction) runs on that task, one packet at a time.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use netengine_config::Config;
use netengine_net::{
    ConnectionId, FrameConfig, IncomingMessage, Message, MessageKind, MessageRouter, Packet,
    PacketKind, ServerTlsSettings, SocketConfig, TransportConfig, TransportServer, decode_message,
    encode_message,
};
use tokio::sync::watch;
use tracing::{debug, error, info, trace, warn};

use crate::error::ServerError;
use crate::events::{DisconnectReason, EventBus, ServerEvent};
use crate::filter::{AuthenticationFilter, Filter, FilterChain, FilterId};
use crate::session::{Client, SessionManager};

/// Server settings.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub bind_addr: SocketAddr,
    /// Initial value of the authentication switch read by [`AuthenticationFilter`].
    pub authentication_mandatory: bool,
    /// How long a connection may stay unauthenticated.
    pub auth_ttl: Duration,
    /// Target tick rate (Hz). Clamped to at least 1.
    pub tick_frequency: u32,
    pub transport: TransportConfig,
    /// Serve TLS with this material when set.
    pub tls: Option<ServerTlsSettings>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 7777)),
            authentication_mandatory: true,
            auth_ttl: Duration::from_secs(10),
            tick_frequency: 33,
            transport: TransportConfig::default(),
            tls: None,
        }
    }
}

impl ServerOptions {
    /// Build options from the `server` and `tls` sections of `config`.
    pub fn from_config(config: &Config) -> Result<Self, ServerError> {
        let server = &config.server;
        let tls = if config.tls.enabled {
            let (Some(cert_path), Some(key_path)) =
                (config.tls.cert_path.clone(), config.tls.key_path.clone())
            else {
                return Err(netengine_config::ConfigError::InvalidValue {
                    field: "tls.cert_path",
                    reason: "TLS needs both a certificate and a key".into(),
                }
                .into());
            };
            Some(ServerTlsSettings {
                cert_path,
                key_path,
                client_ca_path: config
                    .tls
                    .require_client_cert
                    .then(|| config.tls.ca_path.clone())
                    .flatten(),
            })
        } else {
            None
        };

        Ok(Self {
            bind_addr: server.socket_addr()?,
            authentication_mandatory: server.authentication_mandatory,
            auth_ttl: server.auth_ttl(),
            tick_frequency: server.tick_frequency,
            transport: TransportConfig {
                frame: FrameConfig {
                    max_message_size: server.max_message_size,
                },
                socket: SocketConfig {
                    tcp_nodelay: server.tcp_nodelay,
                    ..Default::default()
                },
                max_connections: server.max_connections as usize,
                handshake_timeout: server.handshake_timeout(),
            },
            tls,
        })
    }

    fn tick_period(&self) -> Duration {
        Duration::from_secs(1) / self.tick_frequency.max(1)
    }
}

/// Counters since the server was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub ticks: u64,
    pub packets: u64,
    pub messages_dispatched: u64,
    /// Dropped by a filter.
    pub messages_rejected: u64,
    /// Payloads that did not decode.
    pub decode_failures: u64,
    /// Messages with no handler for their kind.
    pub dispatch_failures: u64,
    pub clients_evicted: u64,
}

#[derive(Default)]
struct StatCounters {
    ticks: AtomicU64,
    packets: AtomicU64,
    messages_dispatched: AtomicU64,
    messages_rejected: AtomicU64,
    decode_failures: AtomicU64,
    dispatch_failures: AtomicU64,
    clients_evicted: AtomicU64,
}

impl StatCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ServerStats {
        ServerStats {
            ticks: self.ticks.load(Ordering::Relaxed),
            packets: self.packets.load(Ordering::Relaxed),
            messages_dispatched: self.messages_dispatched.load(Ordering::Relaxed),
            messages_rejected: self.messages_rejected.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            dispatch_failures: self.dispatch_failures.load(Ordering::Relaxed),
            clients_evicted: self.clients_evicted.load(Ordering::Relaxed),
        }
    }
}

struct Running {
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
}

struct ServerInner {
    options: ServerOptions,
    transport: TransportServer,
    sessions: SessionManager,
    router: MessageRouter<Server>,
    filters: FilterChain,
    auth_filter: FilterId,
    events: EventBus,
    authentication_mandatory: AtomicBool,
    running: Mutex<Option<Running>>,
    current_frequency: AtomicU32,
    stats: StatCounters,
}

/// Cheaply cloneable handle to one server.
///
/// Handlers and filters receive `&Server` and may call any method on it,
/// including [`stop`](Self::stop).
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    /// Create a stopped server. Loads TLS material if configured.
    ///
    /// The [`AuthenticationFilter`] is attached first.
    pub fn new(options: ServerOptions) -> Result<Self, ServerError> {
        let tls = match &options.tls {
            Some(settings) => Some(settings.build().map_err(netengine_net::TransportError::from)?),
            None => None,
        };

        let filters = FilterChain::default();
        let auth_filter = filters.attach(Arc::new(AuthenticationFilter));

        Ok(Self {
            inner: Arc::new(ServerInner {
                transport: TransportServer::new(options.transport.clone(), tls),
                sessions: SessionManager::new(options.auth_ttl),
                router: MessageRouter::new(),
                filters,
                auth_filter,
                events: EventBus::default(),
                authentication_mandatory: AtomicBool::new(options.authentication_mandatory),
                running: Mutex::new(None),
                current_frequency: AtomicU32::new(0),
                stats: StatCounters::default(),
                options,
            }),
        })
    }

    fn running(&self) -> MutexGuard<'_, Option<Running>> {
        self.inner
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Start listening and spawn the tick task. Returns the bound address.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn run(&self) -> Result<SocketAddr, ServerError> {
        let mut running = self.running();
        if running.is_some() {
            return Err(ServerError::AlreadyRunning);
        }

        self.inner.events.emit(ServerEvent::Starting);
        let local_addr = match self.inner.transport.start(self.inner.options.bind_addr) {
            Ok(addr) => addr,
            Err(e) => {
                warn!(addr = %self.inner.options.bind_addr, error = %e, "server failed to start");
                self.inner.events.emit(ServerEvent::Stopped);
                return Err(e.into());
            }
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(tick_loop(
            Arc::downgrade(&self.inner),
            self.inner.options.tick_period(),
            shutdown_rx,
        ));
        *running = Some(Running {
            local_addr,
            shutdown_tx,
        });
        drop(running);

        info!(
            addr = %local_addr,
            tls = self.inner.options.tls.is_some(),
            tick_frequency = self.inner.options.tick_frequency,
            auth_ttl = ?self.inner.options.auth_ttl,
            "server ready"
        );
        self.inner.events.emit(ServerEvent::Ready);
        Ok(local_addr)
    }

    /// Stop ticking, close every connection and empty both pools.
    pub fn stop(&self) -> Result<(), ServerError> {
        let Some(running) = self.running().take() else {
            return Err(ServerError::NotRunning);
        };

        self.inner.events.emit(ServerEvent::Stopping);
        running.shutdown_tx.send_replace(true);
        self.inner.transport.stop();

        for client in self.inner.sessions.drain_all() {
            self.inner.events.emit(ServerEvent::ClientDisconnected {
                client,
                reason: DisconnectReason::Shutdown,
            });
        }
        self.inner.current_frequency.store(0, Ordering::Relaxed);

        info!(addr = %running.local_addr, "server stopped");
        self.inner.events.emit(ServerEvent::Stopped);
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running().is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running().as_ref().map(|r| r.local_addr)
    }

    /// Receive every [`ServerEvent`] emitted from now on.
    pub fn subscribe(&self) -> Receiver<ServerEvent> {
        self.inner.events.subscribe()
    }

    // -----------------------------------------------------------------------
    // Tick
    // -----------------------------------------------------------------------

    /// Process the packets queued right now, then evict expired pending
    /// connections. Returns the number of packets processed.
    ///
    /// The tick task calls this; a host that drives its own loop may too.
    pub fn tick(&self) -> usize {
        let packets = self.inner.transport.drain_packets();
        let count = packets.len();

        for packet in packets {
            self.handle_packet(packet);
        }
        self.evict_expired(Instant::now());

        StatCounters::bump(&self.inner.stats.ticks);
        self.inner
            .stats
            .packets
            .fetch_add(count as u64, Ordering::Relaxed);
        count
    }

    fn handle_packet(&self, packet: Packet) {
        let id = packet.connection_id;
        match packet.kind {
            PacketKind::Connection => self.on_connection(id),
            PacketKind::Data => self.on_data(id, &packet.payload),
            PacketKind::Disconnection => self.on_disconnection(id),
        }
    }

    fn on_connection(&self, id: ConnectionId) {
        // Already gone: its Disconnection packet follows and finds nothing.
        let Some(address) = self.inner.transport.client_address(id) else {
            debug!(connection = %id, "connection closed before it was registered");
            return;
        };

        let client = self.inner.sessions.on_connect(id, address, Instant::now());
        info!(connection = %id, %address, "client connected, awaiting authentication");
        self.inner.events.emit(ServerEvent::ClientConnected(client));
    }

    fn on_data(&self, id: ConnectionId, payload: &[u8]) {
        let message = match decode_message(payload) {
            Ok(message) => message,
            Err(e) => {
                warn!(connection = %id, error = %e, "undecodable message dropped");
                StatCounters::bump(&self.inner.stats.decode_failures);
                return;
            }
        };

        let incoming = IncomingMessage {
            connection_id: id,
            message,
        };
        trace!(connection = %id, kind = %incoming.kind(), "message received");

        if let Err(rejection) = self.inner.filters.evaluate(self, &incoming) {
            debug!(
                connection = %id,
                kind = %incoming.kind(),
                filter = %rejection.name,
                "message rejected"
            );
            StatCounters::bump(&self.inner.stats.messages_rejected);
            return;
        }

        let kind = incoming.kind();
        match self.inner.router.dispatch(self, incoming) {
            Ok(()) => StatCounters::bump(&self.inner.stats.messages_dispatched),
            Err(e) => {
                error!(connection = %id, %kind, error = %e, "message dropped");
                StatCounters::bump(&self.inner.stats.dispatch_failures);
            }
        }
    }

    fn on_disconnection(&self, id: ConnectionId) {
        match self.inner.sessions.remove(id) {
            Some(client) => {
                info!(connection = %id, identifier = ?client.identifier, "client disconnected");
                self.inner.events.emit(ServerEvent::ClientDisconnected {
                    client,
                    reason: DisconnectReason::Remote,
                });
            }
            None => trace!(connection = %id, "disconnection for untracked connection"),
        }
    }

    fn evict_expired(&self, now: Instant) {
        for client in self.inner.sessions.take_expired(now) {
            self.inner.transport.disconnect(client.id);
            info!(
                connection = %client.id,
                ttl = ?self.inner.sessions.auth_ttl(),
                "client evicted, not authenticated in time"
            );
            StatCounters::bump(&self.inner.stats.clients_evicted);
            self.inner.events.emit(ServerEvent::ClientEvicted(client));
        }
    }

    /// Achieved tick rate (Hz) of the last cycle; 0 when stopped.
    pub fn current_frequency(&self) -> u32 {
        self.inner.current_frequency.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> ServerStats {
        self.inner.stats.snapshot()
    }

    // -----------------------------------------------------------------------
    // Handlers and filters
    // -----------------------------------------------------------------------

    /// Register the one handler for `kind`.
    pub fn attach_handler<F>(&self, kind: MessageKind, handler: F) -> Result<(), ServerError>
    where
        F: Fn(&Server, IncomingMessage) + Send + Sync + 'static,
    {
        self.inner.router.attach_handler(kind, handler)?;
        Ok(())
    }

    /// The router, for registering [`MessageHandler`](netengine_net::MessageHandler)
    /// implementations that are not closures.
    pub fn router(&self) -> &MessageRouter<Server> {
        &self.inner.router
    }

    pub fn detach_all_handlers(&self) {
        self.inner.router.detach_all_handlers();
    }

    pub fn registered_kinds(&self) -> Vec<MessageKind> {
        self.inner.router.registered_kinds()
    }

    /// Run the handler for `incoming` now, bypassing the filters.
    pub fn dispatch(&self, incoming: IncomingMessage) -> Result<(), ServerError> {
        self.inner.router.dispatch(self, incoming)?;
        Ok(())
    }

    /// Append `filter` to the chain.
    pub fn attach_filter<F: Filter + 'static>(&self, filter: F) -> FilterId {
        self.inner.filters.attach(Arc::new(filter))
    }

    /// Returns `false` if `id` is not attached.
    pub fn detach_filter(&self, id: FilterId) -> bool {
        self.inner.filters.detach(id)
    }

    pub fn filter_count(&self) -> usize {
        self.inner.filters.len()
    }

    /// Id of the built-in [`AuthenticationFilter`].
    pub fn authentication_filter(&self) -> FilterId {
        self.inner.auth_filter
    }

    pub fn authentication_mandatory(&self) -> bool {
        self.inner.authentication_mandatory.load(Ordering::Relaxed)
    }

    pub fn set_authentication_mandatory(&self, mandatory: bool) {
        self.inner
            .authentication_mandatory
            .store(mandatory, Ordering::Relaxed);
    }

    // -----------------------------------------------------------------------
    // Sessions
    // -----------------------------------------------------------------------

    /// Promote pending connection `id` under `identifier`.
    pub fn authenticate_client(
        &self,
        id: ConnectionId,
        identifier: impl Into<String>,
    ) -> Result<Client, ServerError> {
        let client = self.inner.sessions.authenticate(id, identifier.into())?;
        info!(connection = %id, identifier = ?client.identifier, "client authenticated");
        self.inner
            .events
            .emit(ServerEvent::ClientAuthenticated(client.clone()));
        Ok(client)
    }

    /// Close `id` and drop it from whichever pool holds it.
    pub fn force_disconnect_client(&self, id: ConnectionId) -> Result<(), ServerError> {
        let removed = self.inner.sessions.remove(id);
        let closed = self.inner.transport.disconnect(id);

        match removed {
            Some(client) => {
                info!(connection = %id, "client kicked");
                self.inner.events.emit(ServerEvent::ClientDisconnected {
                    client,
                    reason: DisconnectReason::Kicked,
                });
                Ok(())
            }
            None if closed => Ok(()),
            None => Err(ServerError::UnknownConnection(id)),
        }
    }

    /// Kick every pending and authenticated client.
    pub fn force_disconnect_all(&self) {
        let mut ids: Vec<ConnectionId> = self
            .inner
            .sessions
            .pending_snapshot()
            .into_iter()
            .map(|c| c.id)
            .collect();
        ids.extend(self.inner.sessions.authenticated_ids());

        for id in ids {
            // Raced with a disconnect; nothing left to do.
            let _ = self.force_disconnect_client(id);
        }
    }

    pub fn get_client(&self, id: ConnectionId) -> Result<Client, ServerError> {
        self.inner
            .sessions
            .client(id)
            .ok_or(ServerError::UnknownConnection(id))
    }

    pub fn get_client_by_identifier(&self, identifier: &str) -> Result<Client, ServerError> {
        self.inner
            .sessions
            .client_by_identifier(identifier)
            .ok_or_else(|| ServerError::UnknownIdentifier(identifier.to_string()))
    }

    /// Authenticated clients ordered by id.
    pub fn get_clients(&self) -> Vec<Client> {
        self.inner.sessions.clients_snapshot()
    }

    pub fn get_waiting_list_client(&self, id: ConnectionId) -> Result<Client, ServerError> {
        self.inner
            .sessions
            .pending_client(id)
            .ok_or(ServerError::UnknownConnection(id))
    }

    /// Pending clients ordered by id.
    pub fn get_waiting_list_clients(&self) -> Vec<Client> {
        self.inner.sessions.pending_snapshot()
    }

    pub fn is_authenticated(&self, id: ConnectionId) -> bool {
        self.inner.sessions.is_authenticated(id)
    }

    pub fn is_client_connected(&self, id: ConnectionId) -> bool {
        self.inner.transport.is_connected(id)
    }

    pub fn client_address(&self, id: ConnectionId) -> Option<SocketAddr> {
        self.inner.transport.client_address(id)
    }

    /// Payloads queued for `id` but not yet written.
    pub fn pending_outbound(&self, id: ConnectionId) -> Option<usize> {
        self.inner.transport.pending_outbound(id)
    }

    // -----------------------------------------------------------------------
    // Sending
    // -----------------------------------------------------------------------

    /// Queue `message` for connection `id`, pending or authenticated.
    pub fn send(&self, id: ConnectionId, message: &Message) -> Result<(), ServerError> {
        let payload = encode_message(message)?;
        self.inner.transport.send(id, payload)?;
        Ok(())
    }

    /// Queue `message` for every authenticated client. Returns how many
    /// accepted it.
    pub fn broadcast(&self, message: &Message) -> Result<usize, ServerError> {
        let targets = self.inner.sessions.authenticated_ids();
        self.broadcast_to(&targets, message)
    }

    /// Queue `message` for each of `targets`. Targets that are gone are
    /// skipped; returns how many accepted it.
    pub fn broadcast_to(&self, targets: &[ConnectionId], message: &Message) -> Result<usize, ServerError> {
        let payload = encode_message(message)?;
        self.inner
            .options
            .transport
            .frame
            .check_len(payload.len())
            .map_err(|_| netengine_net::TransportError::OversizedMessage {
                size: payload.len(),
                max: self.inner.options.transport.frame.max_message_size,
            })?;

        let mut delivered = 0;
        for &id in targets {
            match self.inner.transport.send(id, payload.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => debug!(connection = %id, error = %e, "broadcast target skipped"),
            }
        }
        Ok(delivered)
    }
}

async fn tick_loop(inner: Weak<ServerInner>, period: Duration, mut shutdown_rx: watch::Receiver<bool>) {
    debug!(?period, "tick loop started");
    loop {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let server = Server { inner };

        let started = Instant::now();
        server.tick();
        let elapsed = started.elapsed();

        // Rate the cycle would achieve; never above the target.
        let cycle = elapsed.max(period);
        let frequency = (1.0 / cycle.as_secs_f64()).round() as u32;
        server
            .inner
            .current_frequency
            .store(frequency, Ordering::Relaxed);
        drop(server);

        if elapsed > period {
            warn!(?elapsed, ?period, "tick overran its budget");
        }

        tokio::select! {
            _ = tokio::time::sleep(period.saturating_sub(elapsed)) => {}
            _ = shutdown_rx.changed() => break,
        }
    }
    debug!("tick loop stopped");
}
