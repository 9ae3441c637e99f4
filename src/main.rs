//! CORS relay
//!
//! ```text
//!                     ┌────────────────────────────────────────────────────┐
//!                     │                    CORS RELAY                      │
//!                     │                                                    │
//!   Browser request   │  ┌─────────┐   ┌──────────┐   ┌──────────────┐     │
//!   ──────────────────┼─▶│   net   │──▶│   http   │──▶│ cors target  │     │
//!                     │  │listener │   │  server  │   │  + policy    │     │
//!                     │  └─────────┘   └────┬─────┘   └──────┬───────┘     │
//!                     │                     │ admit          │             │
//!                     │               ┌─────▼──────┐  ┌──────▼───────┐     │
//!                     │               │  security  │  │   forward    │─────┼──▶ Upstream
//!                     │               │guard + rate│  │engine + body │◀────┼─── server
//!                     │               └────────────┘  └──────┬───────┘     │
//!   Browser response  │  ┌──────────┐                        │             │
//!   ◀─────────────────┼──│ response │◀───────────────────────┘             │
//!                     │  │ + CORS   │                                      │
//!                     │  └──────────┘                                      │
//!                     └────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;

use cors_relay::config::{load_config, ProxyConfig};
use cors_relay::lifecycle::{shutdown_signal, Shutdown};
use cors_relay::observability::{logging, metrics};
use cors_relay::{net, HttpServer};

#[derive(Parser)]
#[command(name = "cors-relay", version, about = "HTTP proxy that adds CORS headers to any response")]
struct Cli {
    /// Path to a TOML config file; defaults apply when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override `listener.bind_address`
    #[arg(short, long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => match load_config(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("cors-relay: {}: {}", path.display(), e);
                return ExitCode::from(2);
            }
        },
        None => ProxyConfig::default(),
    };
    if let Some(listen) = cli.listen {
        config.listener.bind_address = listen;
    }

    logging::init_logging(&config.observability);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "cors-relay starting");
    tracing::info!(
        bind_address = %config.listener.bind_address,
        max_concurrent = config.limits.max_concurrent,
        max_redirects = config.forwarding.max_redirects,
        whitelist = config.cors.origin_whitelist.len(),
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

    let listener = match net::bind(&config.listener).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(error = %e, "Startup failed");
            return ExitCode::from(1);
        }
    };

    let drain_timeout = Duration::from_secs(config.lifecycle.drain_timeout_secs);
    let shutdown = Shutdown::new();
    let server = HttpServer::new(config);
    let mut handle = tokio::spawn(server.run(listener, shutdown.subscribe()));

    tokio::select! {
        _ = shutdown_signal() => {}
        result = &mut handle => {
            return match result {
                Ok(Ok(())) => ExitCode::SUCCESS,
                Ok(Err(e)) => {
                    tracing::error!(error = %e, "Server exited with error");
                    ExitCode::from(1)
                }
                Err(e) => {
                    tracing::error!(error = %e, "Server task failed");
                    ExitCode::from(1)
                }
            };
        }
    }

    shutdown.trigger();
    match tokio::time::timeout(drain_timeout, handle).await {
        Ok(Ok(Ok(()))) => tracing::info!("Shutdown complete"),
        Ok(Ok(Err(e))) => tracing::warn!(error = %e, "Server error while draining"),
        Ok(Err(e)) => tracing::warn!(error = %e, "Server task failed while draining"),
        Err(_) => tracing::warn!(
            drain_timeout_secs = drain_timeout.as_secs(),
            "Drain timeout elapsed, closing remaining connections"
        ),
    }
    ExitCode::SUCCESS
}
