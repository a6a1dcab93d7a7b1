//! Infrastructure layer for the link host.
//!
//! Contains the OS-facing adapters: the TCP link to the device and the
//! configuration file.
//!
//! **Dependency rule**: this layer may depend on `application` and
//! `boardlink_core`, but MUST NOT be imported by the `application` layer.

pub mod link;
pub mod storage;
