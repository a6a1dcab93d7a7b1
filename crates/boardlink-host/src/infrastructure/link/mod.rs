//! The TCP link to the device.
//!
//! # Sub-modules
//!
//! - **`connection_manager`** – Owns the listening socket, the connection state
//!   machine and the per-connection workers.  This is the public entry point.
//!
//! - **`packet_queue`** – Unbounded FIFO of packets waiting to be written.
//!
//! - **`incoming`** – Reads and decodes frames from the device, detects the
//!   handshake and reports link events.
//!
//! - **`outgoing`** – Drains the packet queue onto the socket once the device
//!   has been verified.
//!
//! - **`worker`** – Cancellable task handles shared by both workers.
//!
//! # Connection epochs
//!
//! Every accepted TCP connection starts a new *epoch* with its own id.  Workers
//! report back over an event channel scoped to their epoch, so an event that
//! arrives late (say, a read error from a socket that has already been
//! replaced) can never tear down a newer connection.

use std::fmt;
use std::io;

use boardlink_core::DeviceIdentity;

use crate::application::listeners::LinkError;

pub mod connection_manager;
pub mod incoming;
pub(crate) mod outgoing;
pub mod packet_queue;
pub(crate) mod worker;

/// Internal notifications from a worker to the connection manager.
#[derive(Debug)]
pub enum LinkEvent {
    /// The device sent a valid handshake.
    Verified(DeviceIdentity),
    /// A worker hit the end of the connection.
    ShuttingDown(ShutdownReason),
}

/// Why a connection epoch is ending.
#[derive(Debug)]
pub enum ShutdownReason {
    /// The device closed the socket.  Not an error.
    PeerClosed,
    ReadFailed(io::Error),
    WriteFailed(io::Error),
}

impl ShutdownReason {
    /// Converts the reason into the error reported to listeners, if any.
    pub fn into_link_error(self) -> Option<LinkError> {
        match self {
            Self::PeerClosed => None,
            Self::ReadFailed(e) => Some(LinkError::ReadFailed(e)),
            Self::WriteFailed(e) => Some(LinkError::WriteFailed(e)),
        }
    }
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PeerClosed => f.write_str("peer closed"),
            Self::ReadFailed(e) => write!(f, "read failed: {e}"),
            Self::WriteFailed(e) => write!(f, "write failed: {e}"),
        }
    }
}
