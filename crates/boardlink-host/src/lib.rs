//! boardlink-host library entry point.
//!
//! Re-exports all public modules so that integration tests in `tests/`
//! and the binary entry point in `main.rs` share the same module tree.

pub mod application;
pub mod infrastructure;

pub use application::listeners::{LinkError, ListenerManager, LoggingListeners};
pub use infrastructure::link::connection_manager::{AcceptOutcome, ConnectionManager};
pub use infrastructure::storage::config::{AppConfig, LinkConfig};
