//! Connection state of the link to the device.
//!
//! ```text
//!                accept                 handshake
//! Disconnected ─────────► Connected ─────────────► Verified
//!      ▲                      │                       │
//!      └──────────────────────┴───────────────────────┘
//!              shutdown event or disconnect()
//! ```
//!
//! Within one epoch (one accepted connection) the state only moves forward;
//! the only way back is a shutdown, which always lands on `Disconnected`.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Where the link currently is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No peer is connected.  Initial state, and the state after any shutdown.
    #[default]
    Disconnected,
    /// A peer was accepted but has not proven it is a compatible device yet.
    Connected,
    /// The peer sent a valid handshake; outbound packets are flowing.
    Verified,
}

impl ConnectionState {
    /// `true` once a peer has been accepted (verified or not).
    pub fn is_connected(self) -> bool {
        matches!(self, Self::Connected | Self::Verified)
    }

    /// `true` only after the handshake succeeded.
    pub fn is_verified(self) -> bool {
        self == Self::Verified
    }

    /// Whether moving from `self` to `next` respects the state machine.
    ///
    /// Re-entering `Verified` from `Verified` is allowed (the device may repeat
    /// its handshake); `Verified` can never be reached straight from
    /// `Disconnected`.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        match (self, next) {
            (Self::Disconnected, Self::Connected) => true,
            (Self::Connected | Self::Verified, Self::Verified) => true,
            (Self::Connected | Self::Verified, Self::Disconnected) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "DISCONNECTED",
            Self::Connected => "CONNECTED",
            Self::Verified => "VERIFIED",
        };
        f.write_str(name)
    }
}
