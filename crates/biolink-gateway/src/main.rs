//! biolink gateway — entry point.
//!
//! This binary serves the native HTTP dialects of biometric attendance
//! terminals.  Terminals push punches and enrollments to it and collect
//! queued user-sync commands from it; REST-polled terminals are pulled on a
//! timer or on demand.
//!
//! # Usage
//!
//! ```text
//! biolink-gateway [OPTIONS]
//!
//! Options:
//!   --config   <PATH>  TOML configuration file [default: biolink.toml]
//!   --bind     <ADDR>  Listener address, overrides [server] bind_address
//!   --port     <PORT>  Listener port, overrides [server] port
//!   --data-dir <PATH>  Data directory, overrides [storage] data_dir
//!   --init-config      Write the effective configuration to --config and exit
//! ```
//!
//! # Environment variable overrides
//!
//! | Variable            | Flag          |
//! |---------------------|---------------|
//! | `BIOLINK_CONFIG`    | `--config`    |
//! | `BIOLINK_BIND`      | `--bind`      |
//! | `BIOLINK_PORT`      | `--port`      |
//! | `BIOLINK_DATA_DIR`  | `--data-dir`  |
//!
//! `RUST_LOG` takes precedence over `[server] log_level`.
//!
//! # Architecture overview
//!
//! ```text
//! Terminals  (binary / text / REST dialects over HTTP)
//!       ↕
//! biolink-gateway  ← this process
//!   application/     vendor adapters, command queue, enrollment fan-out
//!   infrastructure/
//!     http/          listener, REST client, housekeeping timer
//!     storage/       JSON records, template files, block sessions, config
//!       ↕
//! biolink-core  (reassembly, hybrid codec, command builders)
//! ```

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use biolink_gateway::infrastructure::run_server;
use biolink_gateway::infrastructure::storage::config::{load_config, save_config, AppConfig};

// ── CLI argument definitions ──────────────────────────────────────────────────

/// Biometric terminal protocol gateway.
#[derive(Debug, Parser)]
#[command(
    name = "biolink-gateway",
    about = "HTTP gateway speaking the native protocols of biometric attendance terminals",
    version
)]
struct Cli {
    /// TOML configuration file.  A missing file means all defaults.
    #[arg(long, default_value = "biolink.toml", env = "BIOLINK_CONFIG")]
    config: PathBuf,

    /// IP address to bind the listener to.
    #[arg(long, env = "BIOLINK_BIND")]
    bind: Option<String>,

    /// TCP port to listen on.
    #[arg(long, env = "BIOLINK_PORT")]
    port: Option<u16>,

    /// Directory for records, templates and block sessions.
    #[arg(long, env = "BIOLINK_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Write the effective configuration (defaults plus overrides) to
    /// `--config` and exit without starting the server.
    #[arg(long)]
    init_config: bool,
}

impl Cli {
    /// Loads the configuration file and applies the flag overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if the
    /// resulting bind address is not an IP address.
    fn into_app_config(self) -> anyhow::Result<AppConfig> {
        let mut config = load_config(&self.config)
            .with_context(|| format!("failed to load config from {}", self.config.display()))?;
        self.apply(&mut config)?;
        Ok(config)
    }

    /// Writes `config` to the `--config` path.
    fn write_config(path: &Path, config: &AppConfig) -> anyhow::Result<()> {
        save_config(path, config)
            .with_context(|| format!("failed to write config to {}", path.display()))
    }

    fn apply(self, config: &mut AppConfig) -> anyhow::Result<()> {
        if let Some(bind) = self.bind {
            config.server.bind_address = bind;
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(dir) = self.data_dir {
            config.storage.data_dir = dir;
        }
        config
            .server
            .bind_address
            .parse::<IpAddr>()
            .with_context(|| format!("invalid bind address: '{}'", config.server.bind_address))?;
        Ok(())
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

/// Program entry point.
///
/// # What happens at startup
///
/// 1. CLI arguments are parsed and the configuration file is loaded.
/// 2. `tracing_subscriber` is initialised; `RUST_LOG` wins over the
///    configured level.
/// 3. A Ctrl+C handler is spawned; it clears a shared `AtomicBool`.
/// 4. [`run_server`] wires the stores, binds the port and serves until the
///    flag is cleared.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.clone();
    let init_config = cli.init_config;
    let config = cli.into_app_config()?;

    if init_config {
        Cli::write_config(&config_path, &config)?;
        println!("wrote {}", config_path.display());
        return Ok(());
    }

    // ── Logging setup ─────────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.server.log_level)),
        )
        .init();

    info!(
        "biolink gateway starting — listen={}:{}, data={}",
        config.server.bind_address,
        config.server.port,
        config.storage.data_dir.display()
    );

    // ── Graceful shutdown flag ─────────────────────────────────────────────────
    let running = Arc::new(AtomicBool::new(true));
    let running_clone = Arc::clone(&running);

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("received Ctrl+C — initiating graceful shutdown");
                running_clone.store(false, Ordering::Relaxed);
            }
            Err(e) => {
                tracing::error!("failed to listen for Ctrl+C signal: {e}");
            }
        }
    });

    run_server(config, running).await?;

    info!("biolink gateway stopped");
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
