//! Incoming worker: turns bytes from the device into link events.
//!
//! [`FrameReader::parse_next`] accumulates bytes in a receive buffer and
//! decodes one frame at a time with [`boardlink_core::decode_frame`].  It also
//! enforces the handshake rule: until the device has sent a valid
//! establish-connection frame, any other frame is a protocol violation.
//!
//! [`run_incoming`] is the worker body.  It reports "verified" and "shutting
//! down" to the connection manager over the epoch's event channel and hands
//! every other frame straight to the listeners.

use std::io;
use std::sync::Arc;

use boardlink_core::protocol::{decode_frame, DeviceIdentity, Frame, ProtocolError, ESTABLISH_CONNECTION};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, trace, warn};

use super::worker::Halt;
use super::{LinkEvent, ShutdownReason};
use crate::application::listeners::ListenerManager;

const READ_CHUNK: usize = 4096;

/// One step of progress on the inbound stream.
#[derive(Debug)]
pub enum InboundEvent {
    /// A regular frame arrived after verification.
    PacketReceived(Frame),
    /// The device sent a valid establish-connection frame.
    VerificationConfirmed(DeviceIdentity),
    /// The peer closed its side of the connection.
    StreamClosed,
    /// Reading failed, or the bytes broke the protocol (`InvalidData`).
    ReadError(io::Error),
}

/// Streaming frame parser for one connection epoch.
#[derive(Debug)]
pub struct FrameReader {
    recv_buf: Vec<u8>,
    read_tmp: Vec<u8>,
    verified: bool,
}

impl FrameReader {
    pub fn new() -> Self {
        Self {
            recv_buf: Vec::with_capacity(READ_CHUNK),
            read_tmp: vec![0u8; READ_CHUNK],
            verified: false,
        }
    }

    /// Whether a handshake has been seen on this stream.
    pub fn is_verified(&self) -> bool {
        self.verified
    }

    /// Reads until the next event is available.
    ///
    /// Cancel-safe: if the returned future is dropped while waiting for bytes,
    /// nothing that was already read is lost.
    pub async fn parse_next<R>(&mut self, stream: &mut R) -> InboundEvent
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        loop {
            match decode_frame(&self.recv_buf) {
                Ok((frame, consumed)) => {
                    self.recv_buf.drain(..consumed);
                    return self.classify(frame);
                }
                Err(ProtocolError::InsufficientData { .. }) => {}
                Err(e) => return protocol_violation(e),
            }

            let n = match stream.read(&mut self.read_tmp).await {
                Ok(0) => {
                    if !self.recv_buf.is_empty() {
                        debug!(
                            leftover = self.recv_buf.len(),
                            "stream closed in the middle of a frame"
                        );
                    }
                    return InboundEvent::StreamClosed;
                }
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return InboundEvent::ReadError(e),
            };
            trace!(bytes = n, "read from device");
            self.recv_buf.extend_from_slice(&self.read_tmp[..n]);
        }
    }

    fn classify(&mut self, frame: Frame) -> InboundEvent {
        if frame.opcode == ESTABLISH_CONNECTION || !self.verified {
            return match DeviceIdentity::from_frame(&frame) {
                Ok(identity) => {
                    self.verified = true;
                    InboundEvent::VerificationConfirmed(identity)
                }
                Err(e) => protocol_violation(e),
            };
        }
        InboundEvent::PacketReceived(frame)
    }
}

impl Default for FrameReader {
    fn default() -> Self {
        Self::new()
    }
}

fn protocol_violation(e: ProtocolError) -> InboundEvent {
    InboundEvent::ReadError(io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Body of the incoming worker.
///
/// Locks the input channel for its whole life and returns after reporting
/// `ShuttingDown`, or as soon as it is halted.  It never closes the channel.
pub(crate) async fn run_incoming<R>(
    input: Arc<Mutex<R>>,
    mut halt: Halt,
    events: mpsc::UnboundedSender<LinkEvent>,
    listeners: Arc<dyn ListenerManager>,
) where
    R: AsyncRead + Unpin + Send,
{
    let mut input = input.lock().await;
    let mut reader = FrameReader::new();

    loop {
        let event = tokio::select! {
            biased;
            _ = halt.halted() => {
                debug!("incoming worker halted");
                return;
            }
            event = reader.parse_next(&mut *input) => event,
        };

        match event {
            InboundEvent::VerificationConfirmed(identity) => {
                info!(%identity, "device handshake received");
                if events.send(LinkEvent::Verified(identity)).is_err() {
                    return;
                }
            }
            InboundEvent::PacketReceived(frame) => {
                debug!(%frame, "received frame");
                listeners.on_packet(&frame);
            }
            InboundEvent::StreamClosed => {
                info!("device closed the connection");
                let _ = events.send(LinkEvent::ShuttingDown(ShutdownReason::PeerClosed));
                return;
            }
            InboundEvent::ReadError(e) => {
                warn!("read from device failed: {e}");
                let _ = events.send(LinkEvent::ShuttingDown(ShutdownReason::ReadFailed(e)));
                return;
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
