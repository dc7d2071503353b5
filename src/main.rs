//! Snapshot distribution server.
//!
//! ```text
//!   Client ──▶ net::Listener ──▶ http::server (hyper connection, context)
//!                                   │
//!                                   ▼
//!                  gate ─▶ connection guard ─▶ rate limit ─▶ handlers
//!                                                              │
//!                        storage::SnapshotCatalog ◀────────────┤
//!                        security::validator      ◀────────────┤
//!                        streaming::throttled     ◀────────────┘
//!                        (download guard, byte bucket)
//! ```

use clap::Parser;
use std::error::Error;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use snapshot_server::config::{load_config, validate_config, ConfigError, Environment};
use snapshot_server::http::{BackupServer, ServerError};
use snapshot_server::lifecycle::signals::watch_signals;
use snapshot_server::net::Listener;
use snapshot_server::observability::{init_logging, init_metrics};
use snapshot_server::security::SystemClock;
use snapshot_server::storage::EnvDir;
use snapshot_server::{ServerConfig, Shutdown};

/// Environment variable that overrides the backup directory at request time.
const BACKUP_DIR_VAR: &str = "SNAPSHOT_BACKUP_DIR";

#[derive(Debug, Parser)]
#[command(name = "snapshot-server", version, about = "Serve blockchain snapshot archives over HTTP")]
struct Args {
    /// TOML configuration file.
    #[arg(short, long, env = "SNAPSHOT_SERVER_CONFIG")]
    config: Option<PathBuf>,

    /// Public host name used in advertised URLs.
    #[arg(long)]
    host: Option<String>,

    #[arg(short, long)]
    port: Option<u16>,

    /// Download bandwidth ceiling in bytes per second.
    #[arg(long)]
    max_rate: Option<u64>,

    #[arg(long)]
    backup_dir: Option<PathBuf>,

    /// Hide internal error details from clients.
    #[arg(long)]
    production: bool,
}

impl Args {
    fn into_config(self) -> Result<ServerConfig, ConfigError> {
        let mut config = match &self.config {
            Some(path) => load_config(path)?,
            None => ServerConfig::default(),
        };

        if let Some(host) = self.host {
            config.listener.host = host;
        }
        if let Some(port) = self.port {
            config.listener.port = port;
        }
        if let Some(rate) = self.max_rate {
            config.streaming.max_bytes_per_sec = rate;
        }
        if let Some(dir) = self.backup_dir {
            config.storage.backup_dir = dir;
        }
        if self.production {
            config.environment = Environment::Production;
        }

        validate_config(&config).map_err(ConfigError::Validation)?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let config = Args::parse().into_config()?;
    init_logging(&config.observability)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        host = %config.listener.host,
        port = config.listener.port,
        max_bytes_per_sec = config.streaming.max_bytes_per_sec,
        environment = config.environment.as_str(),
        "snapshot-server starting"
    );

    if config.observability.metrics_enabled {
        let addr: SocketAddr = config.observability.metrics_address.parse()?;
        init_metrics(addr)?;
    }

    let listener =
        Listener::bind(config.listener.bind_address(), config.listener.max_connections).await?;

    let shutdown = Shutdown::new();
    let signal = shutdown.subscribe();
    tokio::spawn(watch_signals(shutdown.clone()));

    let resolver = Arc::new(EnvDir::new(BACKUP_DIR_VAR, config.storage.backup_dir.clone()));
    let server = BackupServer::with_parts(config, resolver, Arc::new(SystemClock));

    match server.run(listener, signal).await {
        Ok(()) => {
            tracing::info!("Shutdown complete");
            Ok(())
        }
        Err(ServerError::ShutdownTimedOut(remaining)) => {
            tracing::warn!(connections = remaining, "Forcing exit with connections still open");
            std::process::exit(1);
        }
        Err(e) => Err(e.into()),
    }
}
