//! Outbound packets.
//!
//! The link layer never looks inside a packet: it only asks for the bytes to
//! write and for something printable to put in the logs.  Anything that can
//! do both can be queued for the device.

use std::fmt;

use crate::protocol::frame::{encode_frame, Frame, ProtocolError};

/// An immutable unit of outbound data.
///
/// `Display` is the packet's identity in log lines; it should be short.
pub trait Packet: fmt::Display + Send + 'static {
    /// The exact bytes to put on the wire for this packet.
    fn serialize(&self) -> Vec<u8>;
}

/// A packet that travels as one opcode-tagged [`Frame`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingPacket {
    frame: Frame,
    encoded: Vec<u8>,
}

impl OutgoingPacket {
    /// Builds a packet, validating that the payload fits in one frame.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::PayloadTooLarge`] for oversized payloads.
    pub fn new(opcode: u8, payload: impl Into<Vec<u8>>) -> Result<Self, ProtocolError> {
        let frame = Frame::new(opcode, payload);
        let encoded = encode_frame(&frame)?;
        Ok(Self { frame, encoded })
    }

    pub fn opcode(&self) -> u8 {
        self.frame.opcode
    }

    pub fn payload(&self) -> &[u8] {
        &self.frame.payload
    }
}

impl Packet for OutgoingPacket {
    fn serialize(&self) -> Vec<u8> {
        self.encoded.clone()
    }
}

impl fmt::Display for OutgoingPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.frame, f)
    }
}
