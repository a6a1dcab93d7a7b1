//! Unbounded FIFO of packets waiting to be written to the device.
//!
//! The queue is an mpsc channel.  Producers hold cheap clones of the sender and
//! never block; the receiver sits behind an async mutex that the outgoing
//! worker holds for its whole life, so at most one worker can drain the queue
//! at a time.
//!
//! ```text
//! send() ─┐
//! send() ─┼──► [ p1 p2 p3 ... ] ──► PacketDrain (held by one outgoing worker)
//! send() ─┘
//! ```
//!
//! [`PacketQueue::clear`] needs the receiver too, so it waits for the current
//! drain to be released.  The connection manager always halts the old worker
//! before clearing.

use std::sync::Arc;

use boardlink_core::Packet;
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};
use tracing::debug;

type BoxedPacket = Box<dyn Packet>;

/// The outbound packet queue shared by producers and the outgoing worker.
#[derive(Clone)]
pub struct PacketQueue {
    tx: mpsc::UnboundedSender<BoxedPacket>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<BoxedPacket>>>,
}

impl PacketQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Arc::new(Mutex::new(rx)),
        }
    }

    /// Appends a packet.  Never blocks.
    pub fn offer(&self, packet: BoxedPacket) {
        debug!(%packet, "offering packet for send");
        // The receiver lives as long as `self`, so the send cannot fail.
        let _ = self.tx.send(packet);
    }

    /// Discards every queued packet and returns how many were dropped.
    pub async fn clear(&self) -> usize {
        let mut rx = self.rx.lock().await;
        let mut dropped = 0;
        while rx.try_recv().is_ok() {
            dropped += 1;
        }
        dropped
    }

    /// Takes exclusive draining rights until the returned handle is dropped.
    pub(crate) async fn drain(&self) -> PacketDrain {
        PacketDrain {
            rx: Arc::clone(&self.rx).lock_owned().await,
        }
    }
}

impl Default for PacketQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Exclusive read access to the queue, held by one outgoing worker.
pub(crate) struct PacketDrain {
    rx: OwnedMutexGuard<mpsc::UnboundedReceiver<BoxedPacket>>,
}

impl PacketDrain {
    /// Waits for the next packet.  Cancel-safe.
    pub(crate) async fn next(&mut self) -> Option<BoxedPacket> {
        self.rx.recv().await
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
