//! The polling client.

use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use crossbeam_channel::Receiver;
use netengine_config::{Config, ConfigError};
use netengine_net::{
    ClientTlsSettings, ConnectionState, FrameConfig, IncomingMessage, Message, MessageKind,
    MessageRouter, PacketKind, SocketConfig, TransportClient, TransportConfig, decode_message,
    encode_message,
};
use tokio::sync::watch;
use tracing::{debug, error, info, trace, warn};

use crate::error::ClientError;
use crate::events::{ClientEvent, EventBus};

/// Client settings.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub server_addr: SocketAddr,
    pub connect_timeout: Duration,
    /// Inbound poll rate (Hz). Clamped to at least 1.
    pub poll_frequency: u32,
    pub transport: TransportConfig,
    pub tls: Option<ClientTlsSettings>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            server_addr: SocketAddr::from(([127, 0, 0, 1], 7777)),
            connect_timeout: Duration::from_secs(10),
            poll_frequency: 33,
            transport: TransportConfig::default(),
            tls: None,
        }
    }
}

impl ClientOptions {
    /// Build options from the `client` and `tls` sections of `config`.
    ///
    /// The server address may be a host name; the first resolved address
    /// is used.
    pub fn from_config(config: &Config) -> Result<Self, ClientError> {
        let client = &config.client;
        let endpoint = client.endpoint();
        let server_addr = endpoint
            .to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or_else(|| ConfigError::InvalidValue {
                field: "client.server_address",
                reason: format!("cannot resolve {endpoint}"),
            })?;

        let tls = if config.tls.enabled {
            let Some(ca_path) = config.tls.ca_path.clone() else {
                return Err(ConfigError::InvalidValue {
                    field: "tls.ca_path",
                    reason: "a TLS client needs a CA bundle".into(),
                }
                .into());
            };
            let identity = match (&config.tls.cert_path, &config.tls.key_path) {
                (Some(cert), Some(key)) if config.tls.require_client_cert => {
                    Some((cert.clone(), key.clone()))
                }
                _ => None,
            };
            Some(ClientTlsSettings {
                ca_path,
                server_name: config.tls.server_name.clone(),
                identity,
            })
        } else {
            None
        };

        Ok(Self {
            server_addr,
            connect_timeout: client.connect_timeout(),
            poll_frequency: client.poll_frequency,
            transport: TransportConfig {
                frame: FrameConfig {
                    max_message_size: client.max_message_size,
                },
                socket: SocketConfig::default(),
                ..Default::default()
            },
            tls,
        })
    }

    fn poll_period(&self) -> Duration {
        Duration::from_secs(1) / self.poll_frequency.max(1)
    }
}

struct ClientInner {
    options: ClientOptions,
    transport: TransportClient,
    router: MessageRouter<GameClient>,
    events: EventBus,
    running: Mutex<Option<watch::Sender<bool>>>,
}

/// Cheaply cloneable handle to one client.
#[derive(Clone)]
pub struct GameClient {
    inner: Arc<ClientInner>,
}

impl GameClient {
    /// Create a stopped client. Loads TLS material if configured.
    pub fn new(options: ClientOptions) -> Result<Self, ClientError> {
        let tls = match &options.tls {
            Some(settings) => Some(settings.build().map_err(netengine_net::TransportError::from)?),
            None => None,
        };

        Ok(Self {
            inner: Arc::new(ClientInner {
                transport: TransportClient::new(options.transport.clone(), tls),
                router: MessageRouter::new(),
                events: EventBus::default(),
                running: Mutex::new(None),
                options,
            }),
        })
    }

    fn running(&self) -> MutexGuard<'_, Option<watch::Sender<bool>>> {
        self.inner
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Connect, then start polling. Fails if the server cannot be reached
    /// within the connect timeout, emitting `Stopped` after `Starting`.
    ///
    /// After the server drops the connection, call [`stop`](Self::stop)
    /// before running again.
    pub async fn run(&self) -> Result<(), ClientError> {
        if self.running().is_some() {
            return Err(ClientError::AlreadyRunning);
        }

        let addr = self.inner.options.server_addr;
        let timeout = self.inner.options.connect_timeout;
        if !self.inner.transport.connect(addr, timeout) {
            return Err(ClientError::AlreadyRunning);
        }
        self.inner.events.emit(ClientEvent::Starting);
        if let Err(e) = self.inner.transport.wait_connected(timeout).await {
            warn!(%addr, error = %e, "could not reach server");
            // Leave the transport idle for the next attempt.
            self.inner.transport.disconnect().await;
            self.inner.events.emit(ClientEvent::Stopped);
            return Err(e.into());
        }
        self.inner.events.emit(ClientEvent::ConnectedToServer);
        info!(%addr, "connected to server");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        {
            let mut running = self.running();
            if running.is_some() {
                return Err(ClientError::AlreadyRunning);
            }
            *running = Some(shutdown_tx);
        }
        tokio::spawn(poll_loop(
            Arc::downgrade(&self.inner),
            self.inner.options.poll_period(),
            shutdown_rx,
        ));

        self.inner.events.emit(ClientEvent::Ready);
        Ok(())
    }

    /// Stop polling and close the connection.
    pub async fn stop(&self) -> Result<(), ClientError> {
        let Some(shutdown_tx) = self.running().take() else {
            return Err(ClientError::NotRunning);
        };

        self.inner.events.emit(ClientEvent::Stopping);
        shutdown_tx.send_replace(true);
        self.inner.transport.disconnect().await;
        self.inner.events.emit(ClientEvent::Stopped);
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running().is_some()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.transport.is_connected()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.transport.state().current()
    }

    pub fn subscribe(&self) -> Receiver<ClientEvent> {
        self.inner.events.subscribe()
    }

    /// Dispatch every message queued right now. Returns the number of
    /// packets processed.
    pub fn poll(&self) -> usize {
        let packets = self.inner.transport.drain_packets();
        let count = packets.len();

        for packet in packets {
            match packet.kind {
                PacketKind::Data => self.on_data(packet.connection_id, &packet.payload),
                PacketKind::Disconnection => {
                    warn!("connection with the server lost");
                    self.inner.events.emit(ClientEvent::Disconnected);
                }
                PacketKind::Connection => trace!("connection packet"),
            }
        }
        count
    }

    fn on_data(&self, id: netengine_net::ConnectionId, payload: &[u8]) {
        let message = match decode_message(payload) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "undecodable message from server dropped");
                return;
            }
        };
        let incoming = IncomingMessage {
            connection_id: id,
            message,
        };
        let kind = incoming.kind();
        if let Err(e) = self.inner.router.dispatch(self, incoming) {
            error!(%kind, error = %e, "message from server dropped");
        }
    }

    /// Send `message` to the server.
    pub fn send(&self, message: &Message) -> Result<(), ClientError> {
        let payload = encode_message(message)?;
        self.inner.transport.send(payload)?;
        Ok(())
    }

    /// Send an authentication request.
    pub fn authenticate(
        &self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<(), ClientError> {
        self.send(&Message::authentication(username, password))
    }

    /// Register the one handler for `kind`.
    pub fn attach_handler<F>(&self, kind: MessageKind, handler: F) -> Result<(), ClientError>
    where
        F: Fn(&GameClient, IncomingMessage) + Send + Sync + 'static,
    {
        self.inner.router.attach_handler(kind, handler)?;
        Ok(())
    }

    pub fn router(&self) -> &MessageRouter<GameClient> {
        &self.inner.router
    }

    pub fn detach_all_handlers(&self) {
        self.inner.router.detach_all_handlers();
    }

    pub fn registered_kinds(&self) -> Vec<MessageKind> {
        self.inner.router.registered_kinds()
    }
}

async fn poll_loop(inner: Weak<ClientInner>, period: Duration, mut shutdown_rx: watch::Receiver<bool>) {
    debug!(?period, "poll loop started");
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown_rx.changed() => break,
        }
        let Some(inner) = inner.upgrade() else {
            break;
        };
        GameClient { inner }.poll();
    }
    debug!("poll loop stopped");
}
