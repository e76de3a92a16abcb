mod cli;

use crate::cli::{LogFormat, StorageBackendArg, CLI};
use anyhow::Context;
use clap::Parser;
use snip_auth::{AuthConfig, AuthManager};
use snip_generator::RandomGenerator;
use snip_shortener::{DeletionPool, DeletionPoolConfig, ShortenerConfig, ShortenerService};
use snip_storage::{PostgresConfig, StorageConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

fn storage_config(config: &CLI) -> anyhow::Result<StorageConfig> {
    Ok(match config.storage {
        StorageBackendArg::Memory => StorageConfig::Memory,
        StorageBackendArg::File => StorageConfig::File {
            dir: config.file_dir.clone(),
        },
        StorageBackendArg::Postgres => {
            let dsn = config
                .postgres_dsn
                .clone()
                .context("postgres dsn is required when storage backend is postgres")?;
            StorageConfig::Postgres(
                PostgresConfig::builder()
                    .dsn(dsn)
                    .max_connections(config.postgres_max_connections)
                    .ping_timeout(config.ping_timeout())
                    .build(),
            )
        }
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = CLI::try_parse()?;
    init_tracing(config.log_format);

    info!(
        base_url = %config.base_url,
        storage_backend = %config.storage,
        "starting snip server"
    );

    let repository = snip_storage::connect(&storage_config(&config)?)
        .await
        .context("failed to open storage backend")?;
    repository.ping().await.context("storage backend is unreachable")?;

    let service = ShortenerService::new(
        repository.clone(),
        RandomGenerator::new(),
        ShortenerConfig::builder()
            .base_url(config.base_url.clone())
            .max_code_attempts(config.max_code_attempts)
            .build(),
    );
    let auth = AuthManager::new(
        repository.clone(),
        AuthConfig::builder()
            .anonymous_secret(config.anonymous_secret.clone())
            .login_secret(config.login_secret.clone())
            .build(),
    )?;
    let pool = DeletionPool::new(
        repository,
        DeletionPoolConfig::builder()
            .workers(config.deletion_workers)
            .queue_capacity(config.deletion_queue_capacity)
            .build(),
    );
    pool.start()?;

    let stats = service.stats().await?;
    info!(
        urls = stats.urls,
        users = stats.users,
        sessions = auth.sessions().len(),
        "snip server ready"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown signal received");

    pool.shutdown().await;
    info!("snip server stopped");
    Ok(())
}
