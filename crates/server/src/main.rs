//! depot server binary.

use anyhow::{Context, Result};
use clap::Parser;
use depot_core::config::{AppConfig, LogFormat, LoggingConfig};
use depot_server::scheduler::SweepKind;
use depot_server::{AppState, create_router};
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use std::net::SocketAddr;
use std::path::Path;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// depot - a GitHub Actions compatible cache server
#[derive(Parser, Debug)]
#[command(name = "depotd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, env = "DEPOT_CONFIG", default_value = "config/server.toml")]
    config: String,
}

/// Merge the optional TOML file with `DEPOT_` environment variables.
fn load_config(path: &str) -> Result<AppConfig> {
    let mut figment = Figment::new();
    if Path::new(path).exists() {
        figment = figment.merge(Toml::file(path));
    }
    let config: AppConfig = figment
        .merge(Env::prefixed("DEPOT_").split("__"))
        .extract()
        .context("failed to load configuration")?;
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;
    Ok(config)
}

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let registry = tracing_subscriber::registry().with(filter);
    match logging.format {
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args.config)
        .with_context(|| format!("configuration from {} and DEPOT_* env", args.config))?;
    init_tracing(&config.logging);

    tracing::info!("depot v{}", env!("CARGO_PKG_VERSION"));
    if Path::new(&args.config).exists() {
        tracing::info!(config_path = %args.config, "Loaded configuration file");
    } else {
        tracing::debug!("No config file found at {}, using defaults and environment", args.config);
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.cluster.workers)
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;
    runtime.block_on(serve(config))
}

async fn serve(config: AppConfig) -> Result<()> {
    depot_server::metrics::register_metrics();

    let storage = depot_storage::from_config(&config.storage)
        .await
        .context("failed to initialize storage")?;
    // Fail fast instead of reporting healthy with unreachable storage.
    storage
        .health_check()
        .await
        .context("storage health check failed")?;
    tracing::info!(backend = storage.backend_name(), "Storage backend ready");

    let metadata = depot_metadata::from_config(&config.metadata)
        .await
        .context("failed to initialize metadata store")?;
    tracing::info!(driver = metadata.driver_name(), "Metadata store ready");

    let state = AppState::new(config.clone(), storage, metadata)
        .context("failed to build application state")?;

    state
        .scheduler
        .recover_stale_jobs()
        .await
        .context("failed to recover orphaned sweep jobs")?;

    if config.cleanup.enabled {
        let cache_schedule = config.cleanup.cache_schedule()?;
        let upload_schedule = config.cleanup.upload_schedule()?;
        state
            .scheduler
            .clone()
            .spawn(SweepKind::Cache, cache_schedule);
        state
            .scheduler
            .clone()
            .spawn(SweepKind::Uploads, upload_schedule);
    } else {
        tracing::info!("Scheduled sweeps disabled");
    }

    if config.cluster.enabled {
        tracing::info!(
            workers = config.cluster.workers,
            "Cluster mode: sharing metadata and storage with other workers"
        );
    }

    let app = create_router(state);
    let addr: SocketAddr = config.server.bind.parse().context("invalid bind address")?;
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind to {addr}"))?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
