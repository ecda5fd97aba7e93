//! Dialing side of the transport.
//!
//! [`TransportClient`] holds at most one connection. Its lifecycle is
//! published on a [`watch`] channel so callers can wait for transitions
//! instead of polling, and everything it receives lands on an inbound
//! packet queue tagged with [`SERVER_CONNECTION`].

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::connection::{ByteStream, ClientToken, spawn_io};
use crate::error::TransportError;
use crate::framing::FrameConfig;
use crate::packet::{ConnectionId, Packet};
use crate::platform::configure_stream;
use crate::tcp_server::TransportConfig;
use crate::tls::ClientTls;

/// Id carried by every packet a [`TransportClient`] produces.
pub const SERVER_CONNECTION: ConnectionId = ConnectionId(0);

/// Client connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Dialing (and handshaking) the server.
    Connecting,
    /// Ready for traffic.
    Connected,
    /// A local disconnect is in progress.
    Disconnecting,
    /// No connection.
    Closed,
}

/// Observable connection state backed by a [`watch`] channel.
pub struct ConnectionStateWatch {
    tx: watch::Sender<ConnectionState>,
    rx: watch::Receiver<ConnectionState>,
}

impl Default for ConnectionStateWatch {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionStateWatch {
    /// Create a watch initialized to [`ConnectionState::Closed`].
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(ConnectionState::Closed);
        Self { tx, rx }
    }

    pub fn set(&self, state: ConnectionState) {
        let _ = self.tx.send(state);
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.rx.clone()
    }

    pub fn current(&self) -> ConnectionState {
        *self.rx.borrow()
    }

    /// Move `from` to `to` atomically; returns `false` if the state was not `from`.
    fn transition(&self, from: &[ConnectionState], to: ConnectionState) -> bool {
        self.tx.send_if_modified(|state| {
            if from.contains(state) {
                *state = to;
                true
            } else {
                false
            }
        })
    }
}

struct Session {
    token: Arc<ClientToken>,
    task: JoinHandle<()>,
}

/// Connects to one server and moves framed bytes to and from it.
pub struct TransportClient {
    config: TransportConfig,
    tls: Option<ClientTls>,
    state: Arc<ConnectionStateWatch>,
    session: Mutex<Option<Session>>,
    last_error: Arc<Mutex<Option<TransportError>>>,
    inbound_tx: Sender<Packet>,
    inbound_rx: Receiver<Packet>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl TransportClient {
    pub fn new(config: TransportConfig, tls: Option<ClientTls>) -> Self {
        let (inbound_tx, inbound_rx) = crossbeam_channel::unbounded();
        Self {
            config,
            tls,
            state: Arc::new(ConnectionStateWatch::new()),
            session: Mutex::new(None),
            last_error: Arc::new(Mutex::new(None)),
            inbound_tx,
            inbound_rx,
        }
    }

    pub fn state(&self) -> &Arc<ConnectionStateWatch> {
        &self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state.current() == ConnectionState::Connected
    }

    pub fn frame_config(&self) -> FrameConfig {
        self.config.frame
    }

    /// Start dialing `addr` in the background, giving up after `timeout`.
    ///
    /// Returns `false` without doing anything while a connection is being
    /// set up or is up. Success is reported by a `Connection` packet, failure
    /// by a `Disconnection` packet and [`take_last_error`](Self::take_last_error).
    pub fn connect(&self, addr: SocketAddr, timeout: Duration) -> bool {
        if !self.state.transition(
            &[ConnectionState::Closed],
            ConnectionState::Connecting,
        ) {
            debug!(state = ?self.state.current(), "connect ignored");
            return false;
        }

        while self.inbound_rx.try_recv().is_ok() {}
        lock(&self.last_error).take();

        let token = ClientToken::new(addr);
        let task = tokio::spawn(run_session(
            addr,
            timeout,
            self.config.clone(),
            self.tls.clone(),
            Arc::clone(&token),
            Arc::clone(&self.state),
            Arc::clone(&self.last_error),
            self.inbound_tx.clone(),
        ));
        *lock(&self.session) = Some(Session { token, task });
        true
    }

    /// Wait until the pending dial resolves, up to `timeout`.
    pub async fn wait_connected(&self, timeout: Duration) -> Result<(), TransportError> {
        let mut rx = self.state.subscribe();
        let settled = tokio::time::timeout(
            timeout,
            rx.wait_for(|s| *s != ConnectionState::Connecting),
        )
        .await;

        let state = match settled {
            Err(_) => return Err(TransportError::ConnectTimeout(timeout)),
            Ok(Err(_)) => return Err(TransportError::LostConnection(SERVER_CONNECTION)),
            Ok(Ok(state)) => *state,
        };

        if state == ConnectionState::Connected {
            Ok(())
        } else {
            Err(self
                .take_last_error()
                .unwrap_or(TransportError::LostConnection(SERVER_CONNECTION)))
        }
    }

    /// The error that ended the last dial attempt, if any.
    pub fn take_last_error(&self) -> Option<TransportError> {
        lock(&self.last_error).take()
    }

    /// Queue `payload` for the server. Never waits for the socket.
    pub fn send(&self, payload: Vec<u8>) -> Result<(), TransportError> {
        let frame = self.config.frame;
        if frame.check_len(payload.len()).is_err() {
            return Err(TransportError::OversizedMessage {
                size: payload.len(),
                max: frame.max_message_size,
            });
        }
        if !self.is_connected() {
            return Err(TransportError::LostConnection(SERVER_CONNECTION));
        }

        let session = lock(&self.session);
        match session.as_ref() {
            Some(s) if !s.token.is_closed() => {
                s.token.enqueue(payload);
                Ok(())
            }
            _ => Err(TransportError::LostConnection(SERVER_CONNECTION)),
        }
    }

    /// Close the connection and wait for its tasks to finish.
    pub async fn disconnect(&self) {
        let Some(session) = lock(&self.session).take() else {
            return;
        };

        let dialing = self.state.current() == ConnectionState::Connecting;
        self.state.transition(
            &[ConnectionState::Connecting, ConnectionState::Connected],
            ConnectionState::Disconnecting,
        );
        session.token.close();
        session.token.clear();
        if dialing {
            session.task.abort();
        }
        let _ = session.task.await;
        self.state.set(ConnectionState::Closed);
        info!("disconnected from server");
    }

    pub fn next_packet(&self) -> Option<Packet> {
        self.inbound_rx.try_recv().ok()
    }

    /// Take the packets queued right now.
    pub fn drain_packets(&self) -> Vec<Packet> {
        let available = self.inbound_rx.len();
        self.inbound_rx.try_iter().take(available).collect()
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_session(
    addr: SocketAddr,
    timeout: Duration,
    config: TransportConfig,
    tls: Option<ClientTls>,
    token: Arc<ClientToken>,
    state: Arc<ConnectionStateWatch>,
    last_error: Arc<Mutex<Option<TransportError>>>,
    inbound: Sender<Packet>,
) {
    let stream = match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return fail(&state, &last_error, &inbound, TransportError::Io(e)),
        Err(_) => {
            return fail(&state, &last_error, &inbound, TransportError::ConnectTimeout(timeout));
        }
    };
    if let Err(e) = configure_stream(&stream, &config.socket) {
        warn!(error = %e, "failed to configure socket");
    }

    match tls {
        None => serve(stream, token, state, inbound, config.frame).await,
        Some(tls) => {
            let handshake = tokio::time::timeout(
                config.handshake_timeout,
                tls.connector.connect(tls.server_name.clone(), stream),
            )
            .await;
            match handshake {
                Ok(Ok(stream)) => serve(stream, token, state, inbound, config.frame).await,
                Ok(Err(e)) => fail(
                    &state,
                    &last_error,
                    &inbound,
                    TransportError::TlsHandshakeFailed(e.to_string()),
                ),
                Err(_) => fail(
                    &state,
                    &last_error,
                    &inbound,
                    TransportError::TlsHandshakeFailed(format!(
                        "timed out after {:?}",
                        config.handshake_timeout
                    )),
                ),
            }
        }
    }
}

async fn serve<S: ByteStream>(
    stream: S,
    token: Arc<ClientToken>,
    state: Arc<ConnectionStateWatch>,
    inbound: Sender<Packet>,
    frame: FrameConfig,
) {
    info!(server = %token.address(), "connected to server");
    state.set(ConnectionState::Connected);
    let _ = inbound.send(Packet::connection(SERVER_CONNECTION));

    let supervisor = spawn_io(SERVER_CONNECTION, stream, token, inbound, frame, || {});
    let _ = supervisor.await;
    state.transition(
        &[ConnectionState::Connected, ConnectionState::Disconnecting],
        ConnectionState::Closed,
    );
}

fn fail(
    state: &ConnectionStateWatch,
    last_error: &Mutex<Option<TransportError>>,
    inbound: &Sender<Packet>,
    error: TransportError,
) {
    warn!(error = %error, "connect failed");
    *lock(last_error) = Some(error);
    let _ = inbound.send(Packet::disconnection(SERVER_CONNECTION));
    state.set(ConnectionState::Closed);
}
