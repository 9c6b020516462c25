//! mux-relay
//!
//! A connection-multiplexing reverse proxy built with Tokio.
//!
//! # Architecture Overview
//!
//! ```text
//!                          ┌──────────────────────────────────────────────────────┐
//!                          │                     MUX RELAY                        │
//!                          │                                                      │
//!     Client connection    │  ┌──────────┐   ┌──────────┐   ┌─────────────────┐   │
//!     ─────────────────────┼─▶│   net    │──▶│  relay   │──▶│   processor     │   │
//!                          │  │ listener │   │  engine  │   │ (h2 / tcp)      │   │
//!                          │  └──────────┘   └────┬─────┘   └────────┬────────┘   │
//!                          │                      │                  │ hint       │
//!                          │                      │                  ▼            │
//!                          │                      │         ┌─────────────────┐   │
//!                          │                      │         │ routing +       │   │
//!                          │                      │         │ load_balancer   │   │
//!                          │                      │         └────────┬────────┘   │
//!                          │                      ▼                  │            │
//!                          │               ┌──────────────┐          │            │   Backend
//!                          │               │   session    │◀─────────┘            │── connections
//!                          │               │   driver     │───────────────────────┼──▶ (many)
//!                          │               └──────────────┘                       │
//!                          │                                                      │
//!                          │   config (hot reload) · lifecycle · observability    │
//!                          └──────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use mux_relay::config::watcher::{self, ConfigWatcher};
use mux_relay::config::{load_config, RelayConfig};
use mux_relay::lifecycle::signals::handle_signals;
use mux_relay::net::Listener;
use mux_relay::observability::{logging, metrics};
use mux_relay::routing::RouteConnector;
use mux_relay::{Server, Shutdown};

#[derive(Parser, Debug)]
#[command(name = "mux-relay", version, about = "Connection-multiplexing reverse proxy")]
struct Cli {
    /// Path to the TOML configuration file. Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Validate the configuration and exit.
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => RelayConfig::default(),
    };
    if cli.check {
        println!("configuration ok");
        return Ok(());
    }

    logging::init(&config.observability)?;
    tracing::info!("mux-relay v{} starting", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        bind_address = %config.listener.bind_address,
        processor = ?config.relay.processor,
        routes = config.routes.len(),
        backends = config.backends.len(),
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let connector = Arc::new(RouteConnector::new(&config));
    let shutdown = Shutdown::new();

    // Reloads from the file watcher and from SIGHUP arrive on one channel.
    let (reload_signal_tx, mut reload_signal_rx) = tokio::sync::mpsc::unbounded_channel();
    let mut _watcher = None;
    if let Some(path) = cli.config.clone() {
        let (config_watcher, mut updates) = ConfigWatcher::new(&path);
        let sender = config_watcher.sender();
        match config_watcher.run() {
            Ok(w) => _watcher = Some(w),
            Err(e) => tracing::warn!(error = %e, "Config watcher unavailable, hot reload disabled"),
        }

        let reload_connector = connector.clone();
        tokio::spawn(async move {
            while let Some(new_config) = updates.recv().await {
                reload_connector.reload(&new_config);
            }
        });
        tokio::spawn(async move {
            while reload_signal_rx.recv().await.is_some() {
                watcher::reload(&path, &sender);
            }
        });
    }

    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = handle_signals(signal_shutdown, reload_signal_tx).await {
            tracing::error!(error = %e, "Failed to install signal handlers");
        }
    });

    let listener = Listener::bind(&config.listener).await?;
    let server = Server::new(&config, connector);
    server.run(listener, shutdown).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
