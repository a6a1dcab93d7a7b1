//! TOML configuration for the link host.
//!
//! The default location is `$XDG_CONFIG_HOME/boardlink/config.toml`, falling
//! back to `~/.config/boardlink/config.toml`.  A missing file is not an error:
//! every field has a default, so a first run works with no config at all.
//!
//! ```toml
//! [host]
//! log_level = "debug"
//!
//! [link]
//! bind_address = "0.0.0.0"
//! port = 4545
//! accept_timeout_ms = 3000
//! halt_grace_ms = 1000
//! ```
//!
//! Fields annotated with `#[serde(default = "some_fn")]` take the value of
//! `some_fn()` when absent, which also keeps older config files loading after
//! new fields are added.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// TCP port the host listens on for the device unless configured otherwise.
pub const DEFAULT_PORT: u16 = 4545;

/// How long one accept attempt blocks before re-checking for disconnection.
pub const DEFAULT_ACCEPT_TIMEOUT_MS: u64 = 3000;

/// How long a halted worker gets to exit before it is aborted.
pub const DEFAULT_HALT_GRACE_MS: u64 = 1000;

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// The config could not be serialized to TOML.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level configuration stored on disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    #[serde(default)]
    pub host: HostConfig,
    #[serde(default)]
    pub link: LinkConfig,
}

/// Process-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HostConfig {
    /// `tracing` filter used when `RUST_LOG` is not set.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Settings of the device link.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LinkConfig {
    /// Address to bind the listening socket to.  `0.0.0.0` binds all interfaces.
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,
    /// TCP port the device connects to.  `0` picks an ephemeral port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Upper bound on one accept attempt, in milliseconds.
    #[serde(default = "default_accept_timeout_ms")]
    pub accept_timeout_ms: u64,
    /// Grace period for a halted worker, in milliseconds.
    #[serde(default = "default_halt_grace_ms")]
    pub halt_grace_ms: u64,
}

impl LinkConfig {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.port)
    }

    pub fn accept_timeout(&self) -> Duration {
        Duration::from_millis(self.accept_timeout_ms)
    }

    pub fn halt_grace(&self) -> Duration {
        Duration::from_millis(self.halt_grace_ms)
    }
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_log_level() -> String {
    "info".to_string()
}
fn default_bind_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_accept_timeout_ms() -> u64 {
    DEFAULT_ACCEPT_TIMEOUT_MS
}
fn default_halt_grace_ms() -> u64 {
    DEFAULT_HALT_GRACE_MS
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            accept_timeout_ms: default_accept_timeout_ms(),
            halt_grace_ms: default_halt_grace_ms(),
        }
    }
}

// ── Config repository ─────────────────────────────────────────────────────────

/// Resolves the default config file path, if the environment allows one.
pub fn default_config_path() -> Option<PathBuf> {
    let base = std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
    Some(base.join("boardlink").join("config.toml"))
}

/// Loads [`AppConfig`] from `path`, returning defaults if the file does not
/// exist.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// and [`ConfigError::Parse`] if the TOML is malformed.
pub fn load_config(path: &Path) -> Result<AppConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(toml::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(AppConfig::default()),
        Err(source) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Persists `config` to `path`, creating the parent directory if needed.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system failures or
/// [`ConfigError::Serialize`] if serialization fails.
pub fn save_config(path: &Path, config: &AppConfig) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
    }

    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────
