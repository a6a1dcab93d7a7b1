//! Outgoing worker: writes queued packets to the device in FIFO order.
//!
//! Only one outgoing worker exists per verified connection.  It holds the
//! queue's drain for its whole life and the output channel lock while it
//! writes.  A halt request is only honoured between packets, so the device
//! never sees half a frame.  If the worker has to be aborted mid-write
//! instead, the connection manager closes the output channel rather than
//! handing it to a new worker.

use std::sync::Arc;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error};

use super::packet_queue::PacketQueue;
use super::worker::Halt;
use super::{LinkEvent, ShutdownReason};

pub(crate) async fn run_outgoing<W>(
    queue: PacketQueue,
    output: Arc<Mutex<W>>,
    mut halt: Halt,
    events: mpsc::UnboundedSender<LinkEvent>,
) where
    W: AsyncWrite + Unpin + Send,
{
    let mut drain = tokio::select! {
        biased;
        _ = halt.halted() => return,
        drain = queue.drain() => drain,
    };

    loop {
        let packet = tokio::select! {
            biased;
            _ = halt.halted() => {
                debug!("outgoing worker halted");
                return;
            }
            packet = drain.next() => match packet {
                Some(p) => p,
                None => return,
            },
        };

        let bytes = packet.serialize();
        let written = {
            let mut out = output.lock().await;
            match out.write_all(&bytes).await {
                Ok(()) => out.flush().await,
                Err(e) => Err(e),
            }
        };

        match written {
            Ok(()) => debug!(%packet, bytes = bytes.len(), "sent packet"),
            Err(e) => {
                error!(%packet, "write to device failed: {e}");
                let _ = events.send(LinkEvent::ShuttingDown(ShutdownReason::WriteFailed(e)));
                return;
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
