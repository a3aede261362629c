use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use pixelift_guard::apikey::{ApiKey, ApiKeyRecord, ApiKeyValidator, InMemoryApiKeyRepository};
use pixelift_guard::concurrency::ConcurrencyGuard;
use pixelift_guard::config::{GuardConfig, StoreConfig};
use pixelift_guard::http::{GuardState, HttpServer};
use pixelift_guard::ratelimit::LimiterRegistry;
use pixelift_guard::store::{CounterStore, MemoryStore, RedisStore};

#[derive(Debug, Parser)]
#[command(name = "pixelift-guard", version, about = "Rate limiting and API key guard for Pixelift")]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long, env = "PIXELIFT_CONFIG")]
    config: Option<PathBuf>,

    /// Override the HTTP listen address
    #[arg(long)]
    listen: Option<std::net::SocketAddr>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the guard service (default)
    Serve,
    /// Generate a new API key and print it with its hash
    GenerateKey,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Some(Command::GenerateKey) = cli.command {
        let key = ApiKey::generate();
        println!("key:    {}", key.as_str());
        println!("prefix: {}", key.display_prefix());
        println!("hash:   {}", key.hash());
        return Ok(());
    }

    init_tracing(cli.log_format);

    info!("Starting Pixelift guard service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = GuardConfig::load(cli.config.as_deref())?;
    if let Some(listen) = cli.listen {
        config.server.http_addr = listen;
    }
    info!(http_addr = %config.server.http_addr, "Configuration loaded");

    let store = build_store(&config).await?;

    let limiters = LimiterRegistry::from_config(&config.rate_limiting, Arc::clone(&store))?;
    info!(limiters = ?limiters.names().collect::<Vec<_>>(), "Rate limiters initialized");

    let repository = Arc::new(InMemoryApiKeyRepository::new());
    for seed in config.api_keys.iter().cloned() {
        repository.insert(ApiKeyRecord::from(seed));
    }
    info!(api_keys = repository.len(), "API key repository loaded");

    let state = GuardState {
        limiters: Arc::new(limiters),
        concurrency: Arc::new(ConcurrencyGuard::from_config(
            &config.concurrency,
            Arc::clone(&store),
        )),
        api_keys: Arc::new(ApiKeyValidator::new(repository)),
        store,
    };

    let server = HttpServer::new(config.server.http_addr, state);
    server.serve_with_shutdown(shutdown_signal()).await?;

    info!("Pixelift guard service stopped");
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match format {
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(true)
            .init(),
    }
}

async fn build_store(config: &GuardConfig) -> anyhow::Result<Arc<dyn CounterStore>> {
    match &config.store {
        StoreConfig::Memory => {
            let store = Arc::new(MemoryStore::new());
            spawn_purge_task(
                Arc::clone(&store),
                Duration::from_secs(config.rate_limiting.purge_interval_secs.max(1)),
            );
            info!("Using in-memory counter store");
            Ok(store as Arc<dyn CounterStore>)
        }
        StoreConfig::Redis(redis) => {
            let store = match RedisStore::connect(redis).await {
                Ok(store) => store,
                Err(e) => {
                    warn!(
                        error = %e,
                        "Redis unavailable at startup, serving with fail-open counters"
                    );
                    RedisStore::connect_in_background(redis)?
                }
            };
            Ok(Arc::new(store) as Arc<dyn CounterStore>)
        }
    }
}

fn spawn_purge_task(store: Arc<MemoryStore>, every: Duration) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            store.purge_expired();
        }
    });
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
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
