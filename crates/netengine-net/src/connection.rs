//! Per-connection I/O shared by both transport roles.
//!
//! Every open connection runs three tasks: a receive loop that turns frames
//! into `Data` packets, a send loop that is the only writer of the stream,
//! and a supervisor that waits for the receive loop to end (for any reason,
//! panics included), tears the send loop down and reports exactly one
//! `Disconnection` packet.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crossbeam_channel::Sender;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

use crate::framing::{FrameConfig, FrameError, read_frame, write_frames};
use crate::packet::{ConnectionId, Packet};

/// Anything the connection tasks can read frames from and write frames to.
pub trait ByteStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> ByteStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// Transport-side state of one connection.
///
/// The outbound queue has its own lock so that enqueueing for one connection
/// never contends with another connection's send loop.
#[derive(Debug)]
pub(crate) struct ClientToken {
    address: SocketAddr,
    outbound: Mutex<VecDeque<Vec<u8>>>,
    wake: Notify,
    close_tx: watch::Sender<bool>,
}

impl ClientToken {
    pub(crate) fn new(address: SocketAddr) -> Arc<Self> {
        let (close_tx, _) = watch::channel(false);
        Arc::new(Self {
            address,
            outbound: Mutex::new(VecDeque::new()),
            wake: Notify::new(),
            close_tx,
        })
    }

    pub(crate) fn address(&self) -> SocketAddr {
        self.address
    }

    fn queue(&self) -> MutexGuard<'_, VecDeque<Vec<u8>>> {
        self.outbound.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a payload and wake the send loop. Never blocks on I/O.
    pub(crate) fn enqueue(&self, payload: Vec<u8>) {
        self.queue().push_back(payload);
        self.wake.notify_one();
    }

    /// Take everything queued so far, in enqueue order.
    fn drain(&self) -> VecDeque<Vec<u8>> {
        std::mem::take(&mut *self.queue())
    }

    pub(crate) fn pending(&self) -> usize {
        self.queue().len()
    }

    pub(crate) fn clear(&self) {
        self.queue().clear();
    }

    /// Ask both loops to stop. Idempotent.
    pub(crate) fn close(&self) {
        self.close_tx.send_replace(true);
    }

    pub(crate) fn is_closed(&self) -> bool {
        *self.close_tx.borrow()
    }

    fn close_signal(&self) -> watch::Receiver<bool> {
        self.close_tx.subscribe()
    }
}

/// Start the receive, send and supervisor tasks for an established stream.
///
/// `on_closed` runs in the supervisor right before the `Disconnection`
/// packet is pushed; the transport uses it to unregister the token.
pub(crate) fn spawn_io<S, F>(
    id: ConnectionId,
    stream: S,
    token: Arc<ClientToken>,
    inbound: Sender<Packet>,
    frame: FrameConfig,
    on_closed: F,
) -> JoinHandle<()>
where
    S: ByteStream,
    F: FnOnce() + Send + 'static,
{
    let (reader, writer) = tokio::io::split(stream);

    let send = tokio::spawn(send_loop(id, writer, Arc::clone(&token), frame));
    let receive = tokio::spawn(receive_loop(
        id,
        reader,
        token.close_signal(),
        inbound.clone(),
        frame,
    ));

    tokio::spawn(async move {
        if let Err(e) = receive.await {
            error!(connection = %id, error = %e, "receive loop aborted");
        }

        // Unflushed outbound data is dropped with the send loop.
        token.close();
        send.abort();
        match send.await {
            Err(e) if e.is_panic() => error!(connection = %id, error = %e, "send loop aborted"),
            _ => {}
        }

        on_closed();
        if inbound.send(Packet::disconnection(id)).is_err() {
            trace!(connection = %id, "inbound queue gone, disconnection not reported");
        }
        debug!(connection = %id, "connection closed");
    })
}

async fn receive_loop<R: AsyncRead + Unpin>(
    id: ConnectionId,
    mut reader: R,
    mut close_rx: watch::Receiver<bool>,
    inbound: Sender<Packet>,
    frame: FrameConfig,
) {
    if *close_rx.borrow_and_update() {
        return;
    }

    loop {
        tokio::select! {
            result = read_frame(&mut reader, &frame) => match result {
                Ok(payload) => {
                    trace!(connection = %id, bytes = payload.len(), "frame received");
                    if inbound.send(Packet::data(id, payload)).is_err() {
                        break;
                    }
                }
                Err(FrameError::ConnectionClosed) => {
                    debug!(connection = %id, "peer closed the stream");
                    break;
                }
                Err(e) => {
                    warn!(connection = %id, error = %e, "receive failed");
                    break;
                }
            },
            _ = close_rx.changed() => {
                debug!(connection = %id, "connection closed locally");
                break;
            }
        }
    }
}

async fn send_loop<W: AsyncWrite + Unpin>(
    id: ConnectionId,
    mut writer: W,
    token: Arc<ClientToken>,
    frame: FrameConfig,
) {
    let mut close_rx = token.close_signal();

    while !token.is_closed() {
        tokio::select! {
            _ = token.wake.notified() => {}
            _ = close_rx.changed() => break,
        }

        let batch = token.drain();
        if batch.is_empty() {
            continue;
        }

        match write_frames(&mut writer, &batch, &frame).await {
            Ok(count) => trace!(connection = %id, frames = count, "outbound queue flushed"),
            Err(e) => {
                warn!(connection = %id, error = %e, "send failed, closing connection");
                token.close();
                break;
            }
        }
    }
}
