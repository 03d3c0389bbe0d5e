use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use admission::admission::AdmissionControl;
use admission::api::AdmissionServer;
use admission::config::AdmissionConfig;

/// Token bucket admission control service.
#[derive(Debug, Parser)]
#[command(name = "admission", version, about)]
struct Args {
    /// YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the listen address
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if args.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init();
    }

    info!("Starting admission service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = AdmissionConfig::load(args.config.as_deref())?;
    if let Some(listen) = args.listen {
        config.server.listen_addr = listen;
    }
    let rl = &config.rate_limiting;
    info!(
        listen_addr = %config.server.listen_addr,
        backend = ?rl.backend,
        identifier = ?rl.identifier,
        capacity = rl.capacity,
        refill_rate = rl.refill_rate,
        window = %rl.window,
        "Configuration loaded"
    );

    // A distributed backend that cannot be reached stops startup here
    let control = Arc::new(AdmissionControl::from_config(rl).await?);

    let sweeper = control.spawn_sweeper(Duration::from_secs(rl.sweep_interval_secs));

    if !rl.enabled {
        warn!("Rate limiting disabled; requests will not be limited");
    }

    let server = AdmissionServer::new(config.server.listen_addr, control.clone())
        .with_enforcement(rl.enabled);

    server.serve_with_shutdown(shutdown_signal()).await?;

    if let Some(sweeper) = sweeper {
        sweeper.abort();
    }

    info!("Admission service stopped");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
