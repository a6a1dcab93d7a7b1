//! # boardlink-core
//!
//! Shared library for boardlink, the host side of a serial-over-TCP bridge to
//! a microcontroller board.  It contains the wire framing, the device
//! handshake and the small set of types the link manager and its users agree
//! on.  It has no dependencies on sockets or an async runtime.
//!
//! - **`protocol`** – How bytes travel over the link.  Every unit of data is a
//!   frame: a one-byte opcode, a two-byte length and an opaque payload.  The
//!   first frame a device sends is the establish-connection handshake.
//!
//! - **`domain`** – The connection state machine and the [`Packet`] contract
//!   for anything the host wants to send to the device.

pub mod domain;
pub mod protocol;

pub use domain::packet::{OutgoingPacket, Packet};
pub use domain::state::ConnectionState;
pub use protocol::frame::{decode_frame, encode_frame, Frame, ProtocolError};
pub use protocol::handshake::DeviceIdentity;
