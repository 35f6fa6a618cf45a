//! Admission control demo service.
//!
//! ```text
//!     Client Request
//!     ──────────────▶ request ID ─▶ trace ─▶ timeout ─▶ admission ─▶ echo handler
//!                                                          │
//!                                                          ├─ local token buckets
//!                                                          └─ Redis (atomic script)
//! ```

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use admission_control::config::{load_config, AppConfig, ConfigWatcher, RateLimitConfig};
use admission_control::http::HttpServer;
use admission_control::lifecycle::{signals::shutdown_signal, Shutdown};
use admission_control::observability::{logging, metrics};
use admission_control::ratelimit::Manager;

#[derive(Debug, Parser)]
#[command(name = "admission-control")]
#[command(about = "Rate limiting admission control in front of an echo service", long_about = None)]
struct Cli {
    /// TOML configuration file; watched for changes.
    #[arg(short, long, env = "ADMISSION_CONFIG")]
    config: Option<PathBuf>,

    /// Use the development rate limit preset (local backend, high limits).
    #[arg(long)]
    dev: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => AppConfig::default(),
    };
    if cli.dev {
        config.rate_limit = RateLimitConfig::development();
    }

    logging::init(&config.observability);
    tracing::info!("admission-control v{} starting", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        bind_address = %config.listener.bind_address,
        request_timeout_secs = config.timeouts.request_secs,
        config_file = ?cli.config,
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

    let manager = Arc::new(Manager::connect(&config).await?);

    // Keep the watcher alive for the lifetime of the server.
    let (_watcher, config_updates) = match &cli.config {
        Some(path) => {
            let (watcher, rx) = ConfigWatcher::new(path);
            (Some(watcher.run()?), rx)
        }
        None => {
            let (_tx, rx) = mpsc::unbounded_channel();
            (None, rx)
        }
    };

    let listener = TcpListener::bind(&config.listener.bind_address).await?;
    tracing::info!(address = %listener.local_addr()?, "Listening for connections");

    let shutdown = Shutdown::new();
    let server = HttpServer::new(config, manager.clone());
    let mut server_task = tokio::spawn(server.run(listener, config_updates, shutdown.subscribe()));

    tokio::select! {
        _ = shutdown_signal() => {
            shutdown.trigger();
            server_task.await??;
        }
        result = &mut server_task => {
            result??;
        }
    }
    manager.close().await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
