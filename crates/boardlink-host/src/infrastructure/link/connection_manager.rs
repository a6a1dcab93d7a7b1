//! ConnectionManager: accepts the device, runs the connection state machine
//! and owns the per-connection workers.
//!
//! # Lifecycle (for beginners)
//!
//! ```text
//!   start() ── bind (once) ── reset_listeners ── accept loop ──► CONNECTED
//!                                                   │
//!                                  incoming worker reads the handshake
//!                                                   │
//!                         LinkEvent::Verified ──► coordinator task
//!                                                   │
//!                      halt old outgoing, clear queue, spawn outgoing ──► VERIFIED
//!
//!   read/write failure or peer close ── LinkEvent::ShuttingDown ──► DISCONNECTED
//!   (the listening socket stays open, so start() can accept the next device)
//! ```
//!
//! [`ConnectionManager`] is a cheap, cloneable handle.  `send()` can be called
//! from any task or thread; `disconnect()` can be called while another task is
//! blocked inside `start()`.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use boardlink_core::{ConnectionState, Packet};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use super::incoming::run_incoming;
use super::outgoing::run_outgoing;
use super::packet_queue::PacketQueue;
use super::worker::{HaltOutcome, Worker, WorkerTracker};
use super::LinkEvent;
use crate::application::listeners::{LinkError, ListenerManager};
use crate::infrastructure::storage::config::LinkConfig;

/// How a call to [`ConnectionManager::start`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptOutcome {
    /// A peer was accepted; the link is now `Connected`.
    Connected(SocketAddr),
    /// `disconnect()` was requested before a peer arrived.
    Disconnected,
}

/// Everything that belongs to one accepted connection.
struct Epoch {
    id: Uuid,
    peer: SocketAddr,
    input: Arc<Mutex<OwnedReadHalf>>,
    output: Arc<Mutex<OwnedWriteHalf>>,
    incoming: Option<Worker>,
    outgoing: Option<Worker>,
    events: mpsc::UnboundedSender<LinkEvent>,
}

struct Inner {
    config: LinkConfig,
    state: watch::Sender<ConnectionState>,
    queue: PacketQueue,
    listeners: Arc<dyn ListenerManager>,
    disconnect: watch::Sender<bool>,
    listener: Mutex<Option<Arc<TcpListener>>>,
    epoch: Mutex<Option<Epoch>>,
    workers: WorkerTracker,
}

/// Host-side manager of the TCP link to the device.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    /// Creates a manager in the `Disconnected` state.  Nothing is bound yet.
    pub fn new(config: LinkConfig, listeners: Arc<dyn ListenerManager>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (disconnect, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                config,
                state,
                queue: PacketQueue::new(),
                listeners,
                disconnect,
                listener: Mutex::new(None),
                epoch: Mutex::new(None),
                workers: WorkerTracker::new(),
            }),
        }
    }

    // ── Queries ───────────────────────────────────────────────────────────────

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    pub fn is_verified(&self) -> bool {
        self.state().is_verified()
    }

    /// Returns a receiver that observes every state transition.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Address of the listening socket, if one is open.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        let guard = self.inner.listener.lock().await;
        guard.as_ref().and_then(|l| l.local_addr().ok())
    }

    // ── Operations ────────────────────────────────────────────────────────────

    /// Binds the listening socket if it is not bound yet and returns its
    /// local address.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::BindFailed`] if the address cannot be bound, or
    /// [`LinkError::Closed`] after `disconnect()`.
    pub async fn bind(&self) -> Result<SocketAddr, LinkError> {
        let listener = self.listener().await?;
        let addr = self.inner.config.listen_addr();
        listener
            .local_addr()
            .map_err(|source| LinkError::BindFailed { addr, source })
    }

    /// Waits for a device to connect.
    ///
    /// Binds on first use, resets the listeners, then accepts with the
    /// configured timeout until a peer arrives or `disconnect()` is called.
    ///
    /// # Errors
    ///
    /// [`LinkError::BindFailed`] if binding fails, or
    /// [`LinkError::AcceptFailed`] for an accept error that is not transient.
    pub async fn start(&self) -> Result<AcceptOutcome, LinkError> {
        let mut disconnect_rx = self.inner.disconnect.subscribe();
        if *disconnect_rx.borrow_and_update() {
            return Ok(AcceptOutcome::Disconnected);
        }

        let listener = match self.listener().await {
            Err(LinkError::Closed) => return Ok(AcceptOutcome::Disconnected),
            other => other?,
        };
        let addr = listener
            .local_addr()
            .unwrap_or_else(|_| self.inner.config.listen_addr());
        let accept_timeout = self.inner.config.accept_timeout();

        self.inner.listeners.reset_listeners();
        info!(%addr, "waiting for device");

        let (stream, peer) = loop {
            tokio::select! {
                biased;
                _ = disconnect_requested(&mut disconnect_rx) => {
                    debug!(%addr, "accept loop stopped by disconnect");
                    return Ok(AcceptOutcome::Disconnected);
                }
                accepted = tokio::time::timeout(accept_timeout, listener.accept()) => match accepted {
                    Err(_) => trace!(%addr, "accept timed out; retrying"),
                    Ok(Ok(pair)) => break pair,
                    Ok(Err(source)) if is_transient_accept_error(&source) => {
                        warn!(%addr, "transient accept error: {source}");
                        self.inner
                            .listeners
                            .on_link_error(&LinkError::AcceptFailed { addr, source });
                    }
                    Ok(Err(source)) => return Err(LinkError::AcceptFailed { addr, source }),
                },
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            debug!(%peer, "could not disable Nagle: {e}");
        }

        let mut epoch_slot = self.inner.epoch.lock().await;
        if *self.inner.disconnect.borrow() {
            debug!(%peer, "dropping peer accepted during disconnect");
            return Ok(AcceptOutcome::Disconnected);
        }
        if let Some(stale) = epoch_slot.take() {
            warn!(epoch = %stale.id, "replacing a connection that was never shut down");
            self.teardown(stale).await;
        }

        let (read_half, write_half) = stream.into_split();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let mut epoch = Epoch {
            id: Uuid::new_v4(),
            peer,
            input: Arc::new(Mutex::new(read_half)),
            output: Arc::new(Mutex::new(write_half)),
            incoming: None,
            outgoing: None,
            events: events_tx,
        };
        info!(epoch = %epoch.id, %peer, "device connected");
        self.set_state(ConnectionState::Connected);

        epoch.incoming = Some(Worker::spawn("incoming", &self.inner.workers, {
            let input = Arc::clone(&epoch.input);
            let events = epoch.events.clone();
            let listeners = Arc::clone(&self.inner.listeners);
            move |halt| run_incoming(input, halt, events, listeners)
        }));
        self.spawn_coordinator(epoch.id, events_rx);
        *epoch_slot = Some(epoch);

        Ok(AcceptOutcome::Connected(peer))
    }

    /// Queues a packet for the device.  Never blocks and never fails.
    ///
    /// Packets queued before the device is verified are discarded when it
    /// verifies.  After `disconnect()` packets are dropped.
    pub fn send<P: Packet>(&self, packet: P) {
        if *self.inner.disconnect.borrow() {
            debug!(%packet, "link disconnected; dropping packet");
            return;
        }
        self.inner.queue.offer(Box::new(packet));
    }

    /// Stops everything: the accept loop, both workers, the peer socket and
    /// the listening socket.
    ///
    /// Idempotent.  After it, `start()` returns `Disconnected` at once.
    pub async fn disconnect(&self) {
        let already = self.inner.disconnect.send_replace(true);
        if !already {
            info!("disconnect requested");
        }
        self.shutdown_epoch(None).await;

        let dropped = self.inner.queue.clear().await;
        if dropped > 0 {
            debug!(dropped, "discarded packets that were never sent");
        }

        if let Some(listener) = self.inner.listener.lock().await.take() {
            if let Ok(addr) = listener.local_addr() {
                info!(%addr, "listening socket closed");
            }
        }
    }

    /// Waits until every worker task has finished.
    pub async fn join(&self) {
        debug!(active = self.inner.workers.active(), "joining workers");
        self.inner.workers.wait_idle().await;
    }

    /// Accepts devices one after another until `disconnect()` is called.
    ///
    /// # Errors
    ///
    /// Propagates the errors of [`start`](Self::start).
    pub async fn run(&self) -> Result<(), LinkError> {
        loop {
            match self.start().await? {
                AcceptOutcome::Disconnected => return Ok(()),
                AcceptOutcome::Connected(peer) => {
                    self.wait_until_disconnected().await;
                    debug!(%peer, "connection ended; accepting again");
                }
            }
        }
    }

    /// Applies a worker event to the epoch it came from.
    ///
    /// Events from an epoch that has already been torn down are ignored.
    pub(crate) async fn on_state_changed(&self, epoch_id: Uuid, event: LinkEvent) {
        match event {
            LinkEvent::Verified(identity) => {
                let mut slot = self.inner.epoch.lock().await;
                let Some(epoch) = slot.as_mut().filter(|e| e.id == epoch_id) else {
                    debug!(epoch = %epoch_id, "ignoring verification from stale epoch");
                    return;
                };

                let halted = match epoch.outgoing.take() {
                    Some(old) => old.halt(self.inner.config.halt_grace()).await,
                    None => HaltOutcome::Stopped,
                };
                if halted == HaltOutcome::Aborted {
                    // The output may end in a partial frame; it cannot be reused.
                    warn!(epoch = %epoch_id, "outgoing worker aborted mid-write; closing connection");
                    self.inner.listeners.on_link_error(&LinkError::WriteFailed(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "outgoing worker did not stop within the halt grace period",
                    )));
                    if let Some(poisoned) = slot.take() {
                        self.teardown(poisoned).await;
                    }
                    return;
                }

                let dropped = self.inner.queue.clear().await;
                if dropped > 0 {
                    debug!(epoch = %epoch_id, dropped, "discarded packets queued before verification");
                }
                epoch.outgoing = Some(Worker::spawn("outgoing", &self.inner.workers, {
                    let queue = self.inner.queue.clone();
                    let output = Arc::clone(&epoch.output);
                    let events = epoch.events.clone();
                    move |halt| run_outgoing(queue, output, halt, events)
                }));

                info!(epoch = %epoch_id, peer = %epoch.peer, %identity, "device verified");
                self.set_state(ConnectionState::Verified);
                self.inner.listeners.on_device_verified(&identity);
            }
            LinkEvent::ShuttingDown(reason) => {
                info!(epoch = %epoch_id, %reason, "connection shutting down");
                if let Some(error) = reason.into_link_error() {
                    self.inner.listeners.on_link_error(&error);
                }
                self.shutdown_epoch(Some(epoch_id)).await;
            }
        }
    }

    // ── Internals ─────────────────────────────────────────────────────────────

    async fn listener(&self) -> Result<Arc<TcpListener>, LinkError> {
        let mut slot = self.inner.listener.lock().await;
        // disconnect() sets the flag before it takes this lock, so a socket
        // bound here is always closed by it.
        if *self.inner.disconnect.borrow() {
            return Err(LinkError::Closed);
        }
        if let Some(listener) = slot.as_ref() {
            return Ok(Arc::clone(listener));
        }

        let addr = self.inner.config.listen_addr();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| LinkError::BindFailed { addr, source })?;
        let listener = Arc::new(listener);
        if let Ok(bound) = listener.local_addr() {
            info!(addr = %bound, "listening for device");
        }
        *slot = Some(Arc::clone(&listener));
        Ok(listener)
    }

    fn spawn_coordinator(&self, epoch_id: Uuid, mut events: mpsc::UnboundedReceiver<LinkEvent>) {
        let manager = self.clone();
        self.inner.workers.spawn("coordinator", async move {
            while let Some(event) = events.recv().await {
                let ending = matches!(event, LinkEvent::ShuttingDown(_));
                manager.on_state_changed(epoch_id, event).await;
                if ending {
                    break;
                }
            }
            trace!(epoch = %epoch_id, "coordinator finished");
        });
    }

    /// Tears down the current epoch.  With `Some(id)`, only if it is still
    /// the current one.
    async fn shutdown_epoch(&self, only: Option<Uuid>) {
        let mut slot = self.inner.epoch.lock().await;
        let matches = match (slot.as_ref(), only) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(epoch), Some(id)) => epoch.id == id,
        };
        if !matches {
            return;
        }
        if let Some(epoch) = slot.take() {
            self.teardown(epoch).await;
        }
    }

    /// Halts both workers, closes the channels, then publishes
    /// `Disconnected`.
    async fn teardown(&self, mut epoch: Epoch) {
        let grace = self.inner.config.halt_grace();
        if let Some(worker) = epoch.outgoing.take() {
            worker.halt(grace).await;
        }
        if let Some(worker) = epoch.incoming.take() {
            worker.halt(grace).await;
        }

        if let Err(e) = epoch.output.lock().await.shutdown().await {
            debug!(epoch = %epoch.id, "closing output channel: {e}");
        }
        drop(epoch.input);
        drop(epoch.output);
        info!(epoch = %epoch.id, peer = %epoch.peer, "peer socket closed");
        self.set_state(ConnectionState::Disconnected);
    }

    fn set_state(&self, next: ConnectionState) {
        let mut previous = next;
        let changed = self.inner.state.send_if_modified(|state| {
            if *state == next || !state.can_transition_to(next) {
                previous = *state;
                return false;
            }
            previous = *state;
            *state = next;
            true
        });
        if changed {
            info!(from = %previous, to = %next, "connection state changed");
            self.inner.listeners.on_state_changed(next);
        } else if previous != next {
            warn!(from = %previous, to = %next, "ignoring invalid state transition");
        }
    }

    async fn wait_until_disconnected(&self) {
        let mut state = self.subscribe();
        let mut disconnect = self.inner.disconnect.subscribe();
        loop {
            if *state.borrow_and_update() == ConnectionState::Disconnected {
                return;
            }
            tokio::select! {
                changed = state.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                _ = disconnect_requested(&mut disconnect) => return,
            }
        }
    }
}

/// Completes once `disconnect()` has been requested.  Cancel-safe.
async fn disconnect_requested(rx: &mut watch::Receiver<bool>) {
    loop {
        let requested = *rx.borrow_and_update();
        if requested || rx.changed().await.is_err() {
            return;
        }
    }
}

/// Accept errors caused by one misbehaving peer rather than the listener.
fn is_transient_accept_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    )
}

// ── Tests ─────────────────────────────────────────────────────────────────────
