//! proxy-fleet control plane.
//!
//! ```text
//!   control client ──REST──▶ api router ──▶ registry ──▶ instance (port N)
//!                                │                         │
//!                                ▼                         ▼
//!                           controller ──settings──▶ engine: policy, HAR, shaping
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;

use proxy_fleet::config::{load_config, FleetConfig};
use proxy_fleet::lifecycle::shutdown_signal;
use proxy_fleet::observability::{logging, metrics};
use proxy_fleet::{api, HttpEngine, ProxyRegistry};

#[derive(Parser)]
#[command(name = "proxy-fleet")]
#[command(about = "Control plane for a fleet of intercepting HTTP proxies", long_about = None)]
struct Args {
    /// TOML configuration file. Built-in defaults are used when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override `control.bind_address`.
    #[arg(long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => load_config(path)?,
        None => FleetConfig::default(),
    };
    if let Some(bind) = args.bind {
        config.control.bind_address = bind;
    }

    logging::init(&config.observability);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "proxy-fleet starting");
    tracing::info!(
        bind_address = %config.control.bind_address,
        port_start = config.ports.start,
        port_end = config.ports.end,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        if let Ok(addr) = config.observability.metrics_address.parse() {
            metrics::init_metrics(addr);
        } else {
            tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            );
        }
    }

    let registry = Arc::new(ProxyRegistry::new(&config, Arc::new(HttpEngine::new())));
    let app = api::router(Arc::clone(&registry), config.control.max_body_size);

    let listener = TcpListener::bind(&config.control.bind_address).await?;
    tracing::info!(address = %listener.local_addr()?, "Control API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    registry.shutdown_all().await;
    tracing::info!("Shutdown complete");
    Ok(())
}
