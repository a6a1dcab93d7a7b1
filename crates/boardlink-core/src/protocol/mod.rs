//! Wire protocol: opaque frame codec plus the device handshake frame.

pub mod frame;
pub mod handshake;

pub use frame::{decode_frame, encode_frame, Frame, ProtocolError, FRAME_HEADER_SIZE, MAX_PAYLOAD_LEN};
pub use handshake::{DeviceIdentity, DEVICE_MAGIC, ESTABLISH_CONNECTION};
