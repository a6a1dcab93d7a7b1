//! Storage infrastructure: configuration file persistence.
//!
//! The `config` sub-module reads the TOML configuration (falling back to
//! defaults on first run), writes it back when asked, and turns it into the
//! [`config::LinkConfig`] the connection manager is constructed with.

pub mod config;
