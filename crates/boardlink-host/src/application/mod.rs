//! Application layer: what the host application plugs into the link.
//!
//! The link manager in `infrastructure::link` depends on the
//! [`listeners::ListenerManager`] trait defined here, never on a concrete
//! implementation, so embedders can swap in their own listener logic without
//! touching the connection code.
//!
//! # Sub-modules
//!
//! - **`listeners`** – The listener callback trait, the [`listeners::LinkError`]
//!   type delivered through it, and a logging implementation.

pub mod listeners;
