use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::http::HeaderName;
use clap::Parser;
use tokio::signal;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use blockgate::config::{BackendKind, GateConfig, LogFormat, LoggingConfig};
use blockgate::http::{GateState, HttpServer};
use blockgate::ratelimit::{MemoryStorage, PolicyTable, RateLimiter, RateStorage, RedisStorage};

/// Fixed-window request rate gate.
#[derive(Debug, Parser)]
#[command(name = "blockgate", version, about)]
struct Cli {
    /// YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// HTTP listen address, overrides the configuration
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Storage backend, overrides the configuration
    #[arg(long, value_enum)]
    backend: Option<BackendKind>,

    /// Log output format, overrides the configuration
    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Variables already set in the environment win over `.env`.
    let dotenv = dotenvy::dotenv();

    let mut config =
        GateConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(listen) = cli.listen {
        config.server.listen_addr = listen;
    }
    if let Some(backend) = cli.backend {
        config.storage.backend = backend;
    }
    if let Some(format) = cli.log_format {
        config.logging.format = format;
    }

    init_tracing(&config.logging);

    info!("Starting Blockgate Rate Gate");
    match &dotenv {
        Ok(path) => info!(path = %path.display(), "Loaded environment file"),
        Err(e) if e.not_found() => debug!("No .env file found, using process environment"),
        Err(e) => warn!(error = %e, "Failed to read .env file"),
    }
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(
        listen_addr = %config.server.listen_addr,
        backend = ?config.storage.backend,
        "Configuration loaded"
    );

    match config.storage.backend {
        BackendKind::Memory => {
            let storage = Arc::new(MemoryStorage::new());
            let _cleanup =
                storage.spawn_cleanup(Duration::from_secs(config.storage.cleanup_interval_secs));
            info!("In-memory storage initialized");
            run(&config, storage).await?;
        }
        BackendKind::Redis => {
            let storage = RedisStorage::connect(
                &config.storage.redis_url,
                Duration::from_millis(config.storage.command_timeout_ms),
            )
            .await
            .context("Failed to connect to Redis")?;
            run(&config, Arc::new(storage)).await?;
        }
    }

    info!("Blockgate Rate Gate stopped");
    Ok(())
}

/// Initialize tracing. `RUST_LOG` takes precedence over the configured level.
fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    match logging.format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn run<S: RateStorage + 'static>(config: &GateConfig, storage: Arc<S>) -> anyhow::Result<()> {
    let policies = PolicyTable::from_config(&config.policy)?;
    info!(overrides = policies.override_count(), "Policies resolved");

    let credential_header = HeaderName::from_bytes(config.server.credential_header.as_bytes())
        .context("Invalid credential header")?;

    let state = GateState {
        limiter: RateLimiter::new(storage),
        policies: Arc::new(policies),
        credential_header,
        trust_forwarded_for: config.server.trust_forwarded_for,
    };

    HttpServer::new(config.server.listen_addr, state)
        .serve_with_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
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
                error!(error = %e, "Failed to install SIGTERM handler");
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
