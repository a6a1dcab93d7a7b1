//! The callback surface the link manager reports to.
//!
//! Whatever the host application does with link events, such as dispatching
//! inbound frames to pin handlers, lives behind [`ListenerManager`].  The link manager only promises *when* each callback
//! fires:
//!
//! | Callback              | Fired when                                         |
//! |-----------------------|----------------------------------------------------|
//! | `reset_listeners`     | once per accept cycle, before waiting for a peer   |
//! | `on_state_changed`    | the [`ConnectionState`] actually changes           |
//! | `on_device_verified`  | the device handshake was accepted                  |
//! | `on_packet`           | a frame arrives after verification                 |
//! | `on_link_error`       | a recoverable failure happened on the link         |
//!
//! Callbacks run on the link's own tasks, so implementations must return
//! quickly and must not call back into the connection manager's async API.

use std::io;
use std::net::SocketAddr;

use boardlink_core::{ConnectionState, DeviceIdentity, Frame};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Failures of the link itself.
///
/// Only [`LinkError::BindFailed`], [`LinkError::Closed`] and non-transient
/// [`LinkError::AcceptFailed`] are ever returned to a caller; everything else
/// reaches the host application through [`ListenerManager::on_link_error`]
/// while the state machine falls back to `Disconnected`.
#[derive(Debug, Error)]
pub enum LinkError {
    /// The listening endpoint could not be bound (usually: port in use).
    #[error("bind failed on {addr}: {source}")]
    BindFailed {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    /// Accepting a peer failed.
    #[error("accept failed on {addr}: {source}")]
    AcceptFailed {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    /// Reading from the device failed, or it broke the protocol.
    #[error("read from device failed: {0}")]
    ReadFailed(#[source] io::Error),
    /// Writing to the device failed.
    #[error("write to device failed: {0}")]
    WriteFailed(#[source] io::Error),
    /// The manager was disconnected and will not bind again.
    #[error("link manager is disconnected")]
    Closed,
}

/// Receives high-level notifications from the connection manager.
#[cfg_attr(test, mockall::automock)]
pub trait ListenerManager: Send + Sync {
    /// Forget per-connection listener state before a new peer is accepted.
    fn reset_listeners(&self);

    fn on_state_changed(&self, _state: ConnectionState) {}

    fn on_device_verified(&self, _identity: &DeviceIdentity) {}

    fn on_packet(&self, _frame: &Frame) {}

    fn on_link_error(&self, _error: &LinkError) {}
}

/// A [`ListenerManager`] that only writes structured log lines.
///
/// This is what the `boardlink-host` binary installs; embedders provide their
/// own implementation.
#[derive(Debug, Default)]
pub struct LoggingListeners;

impl ListenerManager for LoggingListeners {
    fn reset_listeners(&self) {
        debug!("listeners reset for new accept cycle");
    }

    fn on_state_changed(&self, state: ConnectionState) {
        info!(%state, "link state changed");
    }

    fn on_device_verified(&self, identity: &DeviceIdentity) {
        info!(%identity, "device verified");
    }

    fn on_packet(&self, frame: &Frame) {
        debug!(%frame, "frame from device");
    }

    fn on_link_error(&self, error: &LinkError) {
        warn!("link error: {error}");
    }
}
