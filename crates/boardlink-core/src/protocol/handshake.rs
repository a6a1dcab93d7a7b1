//! The establish-connection frame a device sends right after it connects.
//!
//! Payload layout (28 bytes):
//! ```text
//! [magic:4 = "IOIO"][hardware_id:8][bootloader_id:8][firmware_id:8]
//! ```
//! Each id is ASCII, right-padded with NUL bytes.  The host treats a
//! well-formed handshake as proof that the peer is a compatible board; any
//! other first frame means the peer is something else and the link is dropped.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::protocol::frame::{Frame, ProtocolError};

/// Opcode of the establish-connection frame.
pub const ESTABLISH_CONNECTION: u8 = 0x00;

/// Magic bytes that open every establish-connection payload.
pub const DEVICE_MAGIC: [u8; 4] = *b"IOIO";

/// Width of each id field in the handshake payload.
pub const ID_FIELD_LEN: usize = 8;

/// Total payload length of a valid establish-connection frame.
pub const HANDSHAKE_PAYLOAD_LEN: usize = DEVICE_MAGIC.len() + 3 * ID_FIELD_LEN;

/// Version identifiers the board reports during the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub hardware_id: String,
    pub bootloader_id: String,
    pub firmware_id: String,
}

impl DeviceIdentity {
    /// Parses the payload of an establish-connection frame.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::MalformedPayload`] when the payload is too
    /// short and [`ProtocolError::BadMagic`] when it does not start with
    /// [`DEVICE_MAGIC`].
    pub fn from_payload(payload: &[u8]) -> Result<Self, ProtocolError> {
        if payload.len() < HANDSHAKE_PAYLOAD_LEN {
            return Err(ProtocolError::MalformedPayload(format!(
                "establish-connection payload is {} bytes, expected {HANDSHAKE_PAYLOAD_LEN}",
                payload.len()
            )));
        }

        let mut magic = [0u8; 4];
        magic.copy_from_slice(&payload[..4]);
        if magic != DEVICE_MAGIC {
            return Err(ProtocolError::BadMagic(magic));
        }

        let field = |index: usize| {
            let start = DEVICE_MAGIC.len() + index * ID_FIELD_LEN;
            read_id(&payload[start..start + ID_FIELD_LEN])
        };
        Ok(Self {
            hardware_id: field(0),
            bootloader_id: field(1),
            firmware_id: field(2),
        })
    }

    /// Validates that `frame` is an establish-connection frame and parses it.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::UnexpectedOpcode`] for any other opcode, plus
    /// the errors of [`DeviceIdentity::from_payload`].
    pub fn from_frame(frame: &Frame) -> Result<Self, ProtocolError> {
        if frame.opcode != ESTABLISH_CONNECTION {
            return Err(ProtocolError::UnexpectedOpcode(frame.opcode));
        }
        Self::from_payload(&frame.payload)
    }

    /// Builds the establish-connection frame a device with this identity sends.
    ///
    /// Ids longer than [`ID_FIELD_LEN`] bytes are truncated.
    pub fn to_frame(&self) -> Frame {
        let mut payload = Vec::with_capacity(HANDSHAKE_PAYLOAD_LEN);
        payload.extend_from_slice(&DEVICE_MAGIC);
        for id in [&self.hardware_id, &self.bootloader_id, &self.firmware_id] {
            write_id(&mut payload, id);
        }
        Frame::new(ESTABLISH_CONNECTION, payload)
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "hw={} bootloader={} firmware={}",
            self.hardware_id, self.bootloader_id, self.firmware_id
        )
    }
}

fn read_id(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

fn write_id(buf: &mut Vec<u8>, id: &str) {
    let bytes = id.as_bytes();
    let len = bytes.len().min(ID_FIELD_LEN);
    buf.extend_from_slice(&bytes[..len]);
    buf.resize(buf.len() + ID_FIELD_LEN - len, 0);
}

// ── Tests ─────────────────────────────────────────────────────────────────────
