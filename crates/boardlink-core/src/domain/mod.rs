//! Link-level domain types shared by every boardlink crate.
//!
//! Nothing in here touches sockets or a runtime, so the state machine rules and
//! the packet contract can be unit-tested on their own.

pub mod packet;
pub mod state;
