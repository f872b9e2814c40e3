//! Caching reverse proxy.
//!
//! # Architecture Overview
//!
//! ```text
//!                        ┌───────────────────────────────────────────────────────┐
//!                        │                     CACHE PROXY                       │
//!                        │                                                       │
//!   Client Request       │  ┌────────┐   ┌───────────┐   ┌───────┐   ┌───────┐   │
//!   ─────────────────────┼─▶│  http  │──▶│ coalescer │──▶│ cache │──▶│ guard │   │
//!                        │  │ server │   └───────────┘   └───┬───┘   └───┬───┘   │
//!                        │  └────────┘                       │           │       │
//!                        │                              ┌────▼────┐ ┌────▼────┐  │
//!                        │                              │  store  │ │ backend │──┼──▶ Origin
//!                        │                              │memcached│ │  proxy  │  │
//!                        │                              └─────────┘ └─────────┘  │
//!                        │                                                       │
//!                        │   config (TOML + hot reload) · observability ·        │
//!                        │   lifecycle (signals, graceful shutdown)              │
//!                        └───────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;

use clap::Parser;
use tokio::net::TcpListener;

use cache_proxy::config::{load_config, watcher::ConfigWatcher, ProxyConfig};
use cache_proxy::http::HttpServer;
use cache_proxy::lifecycle::{signals, Shutdown};
use cache_proxy::observability::{logging, metrics};

#[derive(Debug, Parser)]
#[command(name = "cache-proxy", version, about = "Caching reverse proxy")]
struct Args {
    /// TOML configuration file; defaults are used when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Validate the configuration and exit.
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => load_config(path)?,
        None => ProxyConfig::default(),
    };

    if args.check {
        println!("configuration ok");
        return Ok(());
    }

    logging::init_logging(&config.observability)?;

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "cache-proxy starting");
    tracing::info!(
        bind_address = %config.listener.bind_address,
        backend = %config.backend.url,
        cache_store = ?config.cache.store,
        request_timeout_secs = config.timeouts.request_secs,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr)?,
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let listener = TcpListener::bind(&config.listener.bind_address).await?;
    tracing::info!(address = %listener.local_addr()?, "Listening for connections");

    let shutdown = Shutdown::new();
    signals::spawn_signal_handler(shutdown.clone());

    // Keep the watcher alive for the lifetime of the server.
    let (config_updates, _watcher) = match &args.config {
        Some(path) => {
            let (watcher, updates) = ConfigWatcher::new(path);
            (updates, Some(watcher.run()?))
        }
        None => (tokio::sync::mpsc::unbounded_channel().1, None),
    };

    let server = HttpServer::new(config)?;
    server.run(listener, config_updates, shutdown.subscribe()).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
