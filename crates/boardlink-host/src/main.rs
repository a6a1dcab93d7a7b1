//! boardlink host entry point.
//!
//! Loads the configuration, installs structured logging and runs the
//! connection manager until Ctrl-C.
//!
//! # Architecture
//!
//! ```text
//! main()
//!  └─ load_config()            -- TOML file, then CLI/env overrides
//!  └─ ConnectionManager::new() -- LoggingListeners as the callback surface
//!  └─ run()                    -- accept, serve one device, accept again
//!       ├─ incoming worker     (per connection)
//!       ├─ outgoing worker     (per verified connection)
//!       └─ coordinator task    (per connection)
//! ```

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use boardlink_host::infrastructure::storage::config::{default_config_path, load_config};
use boardlink_host::{AppConfig, ConnectionManager, LoggingListeners};

/// Command-line arguments.  Every flag overrides the config file.
#[derive(Debug, Parser)]
#[command(name = "boardlink-host", version, about = "Accepts a microcontroller board over TCP")]
struct Args {
    /// Path to the TOML config file.
    #[arg(long, env = "BOARDLINK_CONFIG")]
    config: Option<PathBuf>,

    /// TCP port to listen on.
    #[arg(long, env = "BOARDLINK_PORT")]
    port: Option<u16>,

    /// Address to bind the listening socket to.
    #[arg(long, env = "BOARDLINK_BIND")]
    bind: Option<IpAddr>,

    /// Accept timeout in milliseconds.
    #[arg(long, env = "BOARDLINK_ACCEPT_TIMEOUT_MS")]
    accept_timeout_ms: Option<u64>,
}

impl Args {
    /// Writes every flag that was given over the loaded config.
    fn apply(&self, config: &mut AppConfig) {
        if let Some(port) = self.port {
            config.link.port = port;
        }
        if let Some(bind) = self.bind {
            config.link.bind_address = bind;
        }
        if let Some(ms) = self.accept_timeout_ms {
            config.link.accept_timeout_ms = ms;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match args.config.clone().or_else(default_config_path) {
        Some(path) => load_config(&path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => AppConfig::default(),
    };
    args.apply(&mut config);

    // Initialise structured logging.  `RUST_LOG` wins over the config file.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.host.log_level)),
        )
        .init();

    info!(addr = %config.link.listen_addr(), "boardlink host starting");

    let manager = ConnectionManager::new(config.link, Arc::new(LoggingListeners));

    // ── Ctrl-C handler ────────────────────────────────────────────────────────
    let shutdown = manager.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("shutdown signal received");
                shutdown.disconnect().await;
            }
            Err(e) => error!("cannot listen for Ctrl-C: {e}"),
        }
    });

    let result = manager.run().await;
    manager.disconnect().await;
    manager.join().await;

    result.context("device link failed")?;
    info!("boardlink host stopped");
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
