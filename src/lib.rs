pub mod adapters;
pub mod broadcast;
pub mod companion;
pub mod config;
pub mod db;
pub mod errors;
pub mod models;
pub mod notify;
pub mod relay;
pub mod runner;
pub mod server;

use anyhow::Context;
use companion::CompanionManager;
use config::AppConfig;
use runner::RunManager;
use server::AppState;
use tracing_appender::non_blocking::WorkerGuard;

/// Installs the JSON file subscriber. The returned guard flushes buffered
/// lines when dropped and must live as long as the server.
pub fn init_tracing(config: &AppConfig) -> anyhow::Result<WorkerGuard> {
    let log_dir = config.log_dir();
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("failed to create log directory {}", log_dir.display()))?;
    let file_appender = tracing_appender::rolling::daily(log_dir, "dashboard.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_filter)),
        )
        .json()
        .with_writer(non_blocking)
        .try_init()
        .map_err(|error| anyhow::anyhow!(error.to_string()))?;
    Ok(guard)
}

pub async fn run() -> anyhow::Result<()> {
    let config = AppConfig::load().context("failed to load configuration")?;
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("failed to create data directory {}", config.data_dir.display()))?;
    let _log_guard = init_tracing(&config)?;

    let store = db::open_store(&config).context("failed to open store")?;
    let stale = store.mark_stale_runs()?;
    tracing::info!(backend = store.backend().as_str(), stale_runs = stale, "store ready");

    let notifier = notify::notifier_from_config(&config.notify)?;
    let runs = RunManager::new(store.clone(), notifier, config.runner.clone());
    let companion = CompanionManager::new(config.companion.clone());
    companion.start();

    let listener = tokio::net::TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.bind))?;
    tracing::info!(bind = %config.bind, "dashboard listening");
    let state = AppState::new(config, store, runs, companion);
    server::serve(listener, state).await?;
    Ok(())
}
