//! Listening side of the transport.
//!
//! [`TransportServer`] accepts connections, optionally wraps them in TLS and
//! hands each one to the shared connection tasks. Everything it learns is
//! reported as [`Packet`]s on one inbound queue that the owner drains.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use dashmap::DashMap;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::connection::{ByteStream, ClientToken, spawn_io};
use crate::error::TransportError;
use crate::framing::FrameConfig;
use crate::packet::{ConnectionId, IdGenerator, Packet};
use crate::platform::{SocketConfig, configure_stream, create_listener};
use crate::tls::ServerTls;

/// Tuning shared by both transport roles.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Frame size cap, enforced on send and on receive.
    pub frame: FrameConfig,
    /// Options applied to every socket.
    pub socket: SocketConfig,
    /// Maximum simultaneous connections; 0 means unlimited.
    pub max_connections: usize,
    /// Upper bound on a TLS handshake.
    pub handshake_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            frame: FrameConfig::default(),
            socket: SocketConfig::default(),
            max_connections: 0,
            handshake_timeout: Duration::from_secs(5),
        }
    }
}

struct Shared {
    config: TransportConfig,
    tls: Option<ServerTls>,
    clients: DashMap<ConnectionId, Arc<ClientToken>>,
    ids: IdGenerator,
    accepting: AtomicBool,
    /// Connections accepted and not yet closed, handshakes included.
    slots: AtomicUsize,
    inbound_tx: Sender<Packet>,
    inbound_rx: Receiver<Packet>,
}

struct Listening {
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
}

/// Accepts connections and moves framed bytes to and from them.
pub struct TransportServer {
    shared: Arc<Shared>,
    listening: Mutex<Option<Listening>>,
}

impl TransportServer {
    /// Create an idle transport. `tls` switches every accepted connection
    /// to TLS.
    pub fn new(config: TransportConfig, tls: Option<ServerTls>) -> Self {
        let (inbound_tx, inbound_rx) = crossbeam_channel::unbounded();
        Self {
            shared: Arc::new(Shared {
                config,
                tls,
                clients: DashMap::new(),
                ids: IdGenerator::new(),
                accepting: AtomicBool::new(false),
                slots: AtomicUsize::new(0),
                inbound_tx,
                inbound_rx,
            }),
            listening: Mutex::new(None),
        }
    }

    fn listening(&self) -> MutexGuard<'_, Option<Listening>> {
        self.listening.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bind `addr` and start accepting. Returns the bound address.
    ///
    /// Calling this while already listening does nothing and returns the
    /// existing address.
    pub fn start(&self, addr: SocketAddr) -> Result<SocketAddr, TransportError> {
        let mut listening = self.listening();
        if let Some(active) = listening.as_ref() {
            debug!(addr = %active.local_addr, "transport already listening");
            return Ok(active.local_addr);
        }

        let listener = create_listener(addr, &self.shared.config.socket)?;
        let local_addr = listener.local_addr()?;

        // Packets left over from a previous run belong to dead connections.
        while self.shared.inbound_rx.try_recv().is_ok() {}

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.shared.accepting.store(true, Ordering::SeqCst);
        tokio::spawn(accept_loop(Arc::clone(&self.shared), listener, shutdown_rx));

        info!(
            addr = %local_addr,
            tls = self.shared.tls.is_some(),
            max_connections = self.shared.config.max_connections,
            "transport listening"
        );
        *listening = Some(Listening {
            local_addr,
            shutdown_tx,
        });
        Ok(local_addr)
    }

    /// Stop accepting, then close every open connection.
    ///
    /// Each closed connection still reports its `Disconnection` packet.
    /// Returns `false` if the transport was not listening.
    pub fn stop(&self) -> bool {
        let Some(active) = self.listening().take() else {
            return false;
        };

        self.shared.accepting.store(false, Ordering::SeqCst);
        active.shutdown_tx.send_replace(true);

        let ids: Vec<ConnectionId> = self.shared.clients.iter().map(|e| *e.key()).collect();
        for id in &ids {
            self.disconnect(*id);
        }
        info!(
            addr = %active.local_addr,
            closed = ids.len(),
            "transport stopped"
        );
        true
    }

    pub fn is_active(&self) -> bool {
        self.listening().is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listening().as_ref().map(|l| l.local_addr)
    }

    pub fn frame_config(&self) -> FrameConfig {
        self.shared.config.frame
    }

    /// Queue `payload` for delivery to `id`. Never waits for the socket.
    ///
    /// Oversized payloads are rejected before anything is queued. There is
    /// no bound on how much may pile up for a peer that stops reading.
    pub fn send(&self, id: ConnectionId, payload: Vec<u8>) -> Result<(), TransportError> {
        let frame = self.shared.config.frame;
        if frame.check_len(payload.len()).is_err() {
            return Err(TransportError::OversizedMessage {
                size: payload.len(),
                max: frame.max_message_size,
            });
        }

        let token = self
            .token(id)
            .filter(|t| !t.is_closed())
            .ok_or(TransportError::LostConnection(id))?;
        token.enqueue(payload);
        Ok(())
    }

    /// Close one connection. Returns `false` if `id` is not open.
    ///
    /// The matching `Disconnection` packet follows once its tasks end.
    pub fn disconnect(&self, id: ConnectionId) -> bool {
        match self.shared.clients.remove(&id) {
            Some((_, token)) => {
                token.close();
                token.clear();
                debug!(connection = %id, "disconnect requested");
                true
            }
            None => false,
        }
    }

    pub fn is_connected(&self, id: ConnectionId) -> bool {
        self.token(id).is_some_and(|t| !t.is_closed())
    }

    pub fn client_address(&self, id: ConnectionId) -> Option<SocketAddr> {
        self.token(id).map(|t| t.address())
    }

    pub fn connection_count(&self) -> usize {
        self.shared.clients.len()
    }

    /// Number of payloads queued but not yet written for `id`.
    pub fn pending_outbound(&self, id: ConnectionId) -> Option<usize> {
        self.token(id).map(|t| t.pending())
    }

    /// Pop the next inbound packet, if any.
    pub fn next_packet(&self) -> Option<Packet> {
        self.shared.inbound_rx.try_recv().ok()
    }

    /// Take the packets queued right now. Packets arriving meanwhile are
    /// left for the next call.
    pub fn drain_packets(&self) -> Vec<Packet> {
        let available = self.shared.inbound_rx.len();
        self.shared.inbound_rx.try_iter().take(available).collect()
    }

    fn token(&self, id: ConnectionId) -> Option<Arc<ClientToken>> {
        self.shared.clients.get(&id).map(|e| Arc::clone(e.value()))
    }
}

impl Drop for TransportServer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// One reserved unit of `max_connections`, released on drop.
struct Slot(Arc<Shared>);

impl Drop for Slot {
    fn drop(&mut self) {
        self.0.slots.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Shared {
    /// Reserve a slot for a freshly accepted socket, or `None` at the limit.
    fn reserve_slot(self: &Arc<Self>) -> Option<Slot> {
        let max = self.config.max_connections;
        self.slots
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (max == 0 || n < max).then_some(n + 1)
            })
            .ok()
            .map(|_| Slot(Arc::clone(self)))
    }

    async fn establish(
        self: Arc<Self>,
        slot: Slot,
        id: ConnectionId,
        stream: TcpStream,
        peer: SocketAddr,
    ) {
        let Some(tls) = &self.tls else {
            self.register(slot, id, stream, peer);
            return;
        };

        match handshake(tls, stream, self.config.handshake_timeout).await {
            Ok(stream) => self.register(slot, id, stream, peer),
            Err(e) => warn!(connection = %id, %peer, error = %e, "dropping connection"),
        }
    }

    fn register<S: ByteStream>(
        self: &Arc<Self>,
        slot: Slot,
        id: ConnectionId,
        stream: S,
        peer: SocketAddr,
    ) {
        if !self.accepting.load(Ordering::SeqCst) {
            debug!(connection = %id, %peer, "transport stopped during setup, dropping connection");
            return;
        }

        let token = ClientToken::new(peer);
        self.clients.insert(id, Arc::clone(&token));
        let _ = self.inbound_tx.send(Packet::connection(id));
        info!(connection = %id, %peer, "connection accepted");

        let shared = Arc::clone(self);
        spawn_io(
            id,
            stream,
            token,
            self.inbound_tx.clone(),
            self.config.frame,
            move || {
                shared.clients.remove(&id);
                drop(slot);
            },
        );
    }
}

async fn accept_loop(
    shared: Arc<Shared>,
    listener: TcpListener,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                let (stream, peer) = match result {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                };

                let Some(slot) = shared.reserve_slot() else {
                    warn!(%peer, max = shared.config.max_connections, "connection limit reached, rejecting");
                    continue;
                };
                if let Err(e) = configure_stream(&stream, &shared.config.socket) {
                    warn!(%peer, error = %e, "failed to configure socket, rejecting");
                    continue;
                }

                let id = shared.ids.next_id();
                tokio::spawn(Arc::clone(&shared).establish(slot, id, stream, peer));
            }
            _ = shutdown_rx.changed() => {
                debug!("accept loop stopped");
                break;
            }
        }
    }
}

/// Run the server-side handshake and check the resulting session.
async fn handshake(
    tls: &ServerTls,
    stream: TcpStream,
    limit: Duration,
) -> Result<tokio_rustls::server::TlsStream<TcpStream>, TransportError> {
    let stream = tokio::time::timeout(limit, tls.acceptor.accept(stream))
        .await
        .map_err(|_| TransportError::TlsHandshakeFailed(format!("timed out after {limit:?}")))?
        .map_err(|e| TransportError::TlsHandshakeFailed(e.to_string()))?;

    let (_, session) = stream.get_ref();
    if session.negotiated_cipher_suite().is_none() {
        return Err(TransportError::TlsHandshakeFailed(
            "no cipher suite negotiated".into(),
        ));
    }
    if tls.mutual && session.peer_certificates().is_none_or(|certs| certs.is_empty()) {
        return Err(TransportError::TlsHandshakeFailed(
            "client presented no certificate".into(),
        ));
    }
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::{read_frame, write_frame};
    use crate::packet::PacketKind;

    fn local() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    async fn wait_packet(server: &TransportServer) -> Packet {
        for _ in 0..400 {
            if let Some(packet) = server.next_packet() {
                return packet;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("no packet arrived");
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let server = TransportServer::new(TransportConfig::default(), None);
        let first = server.start(local()).unwrap();
        let second = server.start(local()).unwrap();
        assert_eq!(first, second);
        assert!(server.is_active());
        assert!(server.stop());
        assert!(!server.stop());
    }

    #[tokio::test]
    async fn test_accept_reports_connection_and_data() {
        let server = TransportServer::new(TransportConfig::default(), None);
        let addr = server.start(local()).unwrap();

        let mut peer = TcpStream::connect(addr).await.unwrap();
        let connected = wait_packet(&server).await;
        assert_eq!(connected.kind, PacketKind::Connection);
        assert!(server.is_connected(connected.connection_id));
        assert!(server.client_address(connected.connection_id).is_some());

        write_frame(&mut peer, b"hello", &FrameConfig::default())
            .await
            .unwrap();
        let data = wait_packet(&server).await;
        assert_eq!(data, Packet::data(connected.connection_id, b"hello".to_vec()));
    }

    #[tokio::test]
    async fn test_send_reaches_peer() {
        let server = TransportServer::new(TransportConfig::default(), None);
        let addr = server.start(local()).unwrap();
        let mut peer = TcpStream::connect(addr).await.unwrap();
        let id = wait_packet(&server).await.connection_id;

        server.send(id, b"one".to_vec()).unwrap();
        server.send(id, b"two".to_vec()).unwrap();

        let frame = FrameConfig::default();
        assert_eq!(read_frame(&mut peer, &frame).await.unwrap(), b"one");
        assert_eq!(read_frame(&mut peer, &frame).await.unwrap(), b"two");
    }

    #[tokio::test]
    async fn test_oversized_send_leaves_queue_unchanged() {
        let config = TransportConfig {
            frame: FrameConfig {
                max_message_size: 16,
            },
            ..Default::default()
        };
        let server = TransportServer::new(config, None);
        let addr = server.start(local()).unwrap();
        let _peer = TcpStream::connect(addr).await.unwrap();
        let id = wait_packet(&server).await.connection_id;

        let before = server.pending_outbound(id).unwrap();
        let result = server.send(id, vec![0; 17]);
        assert!(matches!(
            result,
            Err(TransportError::OversizedMessage { size: 17, max: 16 })
        ));
        assert_eq!(server.pending_outbound(id).unwrap(), before);
    }

    #[tokio::test]
    async fn test_send_to_unknown_connection_fails() {
        let server = TransportServer::new(TransportConfig::default(), None);
        server.start(local()).unwrap();
        assert!(matches!(
            server.send(ConnectionId(99), vec![1]),
            Err(TransportError::LostConnection(ConnectionId(99)))
        ));
    }

    #[tokio::test]
    async fn test_disconnect_emits_single_disconnection() {
        let server = TransportServer::new(TransportConfig::default(), None);
        let addr = server.start(local()).unwrap();
        let mut peer = TcpStream::connect(addr).await.unwrap();
        let id = wait_packet(&server).await.connection_id;

        assert!(server.disconnect(id));
        assert!(!server.disconnect(id));
        assert_eq!(wait_packet(&server).await, Packet::disconnection(id));

        let closed = read_frame(&mut peer, &FrameConfig::default()).await;
        assert!(closed.is_err());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(server.next_packet().is_none());
        assert!(!server.is_connected(id));
    }

    #[tokio::test]
    async fn test_peer_hangup_emits_disconnection() {
        let server = TransportServer::new(TransportConfig::default(), None);
        let addr = server.start(local()).unwrap();
        let peer = TcpStream::connect(addr).await.unwrap();
        let id = wait_packet(&server).await.connection_id;

        drop(peer);
        assert_eq!(wait_packet(&server).await, Packet::disconnection(id));
        assert_eq!(server.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_connection_limit_rejects_extra_peers() {
        let config = TransportConfig {
            max_connections: 1,
            ..Default::default()
        };
        let server = TransportServer::new(config, None);
        let addr = server.start(local()).unwrap();

        let _first = TcpStream::connect(addr).await.unwrap();
        assert_eq!(wait_packet(&server).await.kind, PacketKind::Connection);

        let mut second = TcpStream::connect(addr).await.unwrap();
        let rejected = read_frame(&mut second, &FrameConfig::default()).await;
        assert!(rejected.is_err());
        assert!(server.next_packet().is_none());
        assert_eq!(server.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_ids_are_unique_across_reconnects() {
        let server = TransportServer::new(TransportConfig::default(), None);
        let addr = server.start(local()).unwrap();

        let mut seen = std::collections::HashSet::new();
        for _ in 0..5 {
            let peer = TcpStream::connect(addr).await.unwrap();
            let id = wait_packet(&server).await.connection_id;
            assert!(seen.insert(id));
            drop(peer);
            assert_eq!(wait_packet(&server).await.kind, PacketKind::Disconnection);
        }
    }

    #[tokio::test]
    async fn test_stop_disconnects_everyone() {
        let server = TransportServer::new(TransportConfig::default(), None);
        let addr = server.start(local()).unwrap();
        let _a = TcpStream::connect(addr).await.unwrap();
        let _b = TcpStream::connect(addr).await.unwrap();
        wait_packet(&server).await;
        wait_packet(&server).await;

        server.stop();
        let mut disconnections = 0;
        while disconnections < 2 {
            if wait_packet(&server).await.kind == PacketKind::Disconnection {
                disconnections += 1;
            }
        }
        assert_eq!(server.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_drain_packets_takes_snapshot() {
        let server = TransportServer::new(TransportConfig::default(), None);
        let addr = server.start(local()).unwrap();
        let mut peer = TcpStream::connect(addr).await.unwrap();
        wait_packet(&server).await;

        let frame = FrameConfig::default();
        for i in 0..3u8 {
            write_frame(&mut peer, &[i], &frame).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        let drained = server.drain_packets();
        assert_eq!(drained.len(), 3);
        assert_eq!(drained[2].payload, vec![2]);
        assert!(server.drain_packets().is_empty());
    }
}
