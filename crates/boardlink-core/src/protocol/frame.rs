//! Binary framing for bytes exchanged with the device.
//!
//! Wire format:
//! ```text
//! [opcode:1][payload_len:2][payload:N]
//! ```
//! Header size: 3 bytes. `payload_len` is big-endian, so one frame carries at
//! most 65 535 payload bytes.
//!
//! The payload is opaque to this crate.  Only the establish-connection frame
//! (see [`crate::protocol::handshake`]) has a payload layout defined here;
//! everything else is interpreted by whoever registered as a listener.
//!
//! # Streaming (for beginners)
//!
//! TCP delivers a byte *stream*, not messages.  One `read()` may return half a
//! frame or three frames glued together.  [`decode_frame`] therefore never
//! assumes it was handed exactly one frame: it reports how many bytes it
//! consumed, and answers [`ProtocolError::InsufficientData`] when the buffer
//! ends in the middle of a frame so the caller can wait for more bytes.

use std::fmt;

use thiserror::Error;

/// Size of the frame header in bytes.
pub const FRAME_HEADER_SIZE: usize = 3;

/// Largest payload a single frame can carry.
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;

/// Errors that can occur during frame encoding or decoding.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// The buffer ends before the frame does.
    #[error("insufficient data: need at least {needed} bytes, got {available}")]
    InsufficientData { needed: usize, available: usize },

    /// The payload does not fit in the 16-bit length field.
    #[error("payload too large: {len} bytes exceeds the 65535-byte frame limit")]
    PayloadTooLarge { len: usize },

    /// The device sent something other than the handshake before verifying.
    #[error("expected establish-connection frame, got opcode 0x{0:02X}")]
    UnexpectedOpcode(u8),

    /// The handshake frame did not start with the device magic.
    #[error("bad device magic: {0:02X?}")]
    BadMagic([u8; 4]),

    /// The payload could not be parsed (too short, wrong layout).
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
}

/// One opcode-tagged unit of data on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub opcode: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Creates a frame from an opcode and payload bytes.
    pub fn new(opcode: u8, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            opcode,
            payload: payload.into(),
        }
    }

    /// Total number of bytes this frame occupies on the wire.
    pub fn wire_len(&self) -> usize {
        FRAME_HEADER_SIZE + self.payload.len()
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "frame(0x{:02X}, {} bytes)", self.opcode, self.payload.len())
    }
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Encodes a [`Frame`] into its wire representation.
///
/// # Errors
///
/// Returns [`ProtocolError::PayloadTooLarge`] if the payload exceeds
/// [`MAX_PAYLOAD_LEN`].
///
/// # Examples
///
/// ```rust
/// use boardlink_core::protocol::{decode_frame, encode_frame, Frame};
///
/// let frame = Frame::new(0x04, vec![1, 2, 3]);
/// let bytes = encode_frame(&frame).unwrap();
/// assert_eq!(bytes, [0x04, 0x00, 0x03, 1, 2, 3]);
/// let (decoded, consumed) = decode_frame(&bytes).unwrap();
/// assert_eq!(decoded, frame);
/// assert_eq!(consumed, bytes.len());
/// ```
pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>, ProtocolError> {
    let payload_len = u16::try_from(frame.payload.len()).map_err(|_| {
        ProtocolError::PayloadTooLarge {
            len: frame.payload.len(),
        }
    })?;

    let mut buf = Vec::with_capacity(frame.wire_len());
    buf.push(frame.opcode);
    buf.extend_from_slice(&payload_len.to_be_bytes());
    buf.extend_from_slice(&frame.payload);
    Ok(buf)
}

/// Decodes one [`Frame`] from the beginning of `bytes`.
///
/// Returns the frame and the number of bytes consumed (header + payload), so
/// the caller can drain them from its receive buffer.
///
/// # Errors
///
/// Returns [`ProtocolError::InsufficientData`] if `bytes` holds only part of a
/// frame.  That is the normal "read more" signal for streaming callers, not a
/// corrupt stream.
pub fn decode_frame(bytes: &[u8]) -> Result<(Frame, usize), ProtocolError> {
    if bytes.len() < FRAME_HEADER_SIZE {
        return Err(ProtocolError::InsufficientData {
            needed: FRAME_HEADER_SIZE,
            available: bytes.len(),
        });
    }

    let opcode = bytes[0];
    let payload_len = u16::from_be_bytes([bytes[1], bytes[2]]) as usize;
    let total = FRAME_HEADER_SIZE + payload_len;
    if bytes.len() < total {
        return Err(ProtocolError::InsufficientData {
            needed: total,
            available: bytes.len(),
        });
    }

    let payload = bytes[FRAME_HEADER_SIZE..total].to_vec();
    Ok((Frame { opcode, payload }, total))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
