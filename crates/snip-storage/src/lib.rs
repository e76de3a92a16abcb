//! Storage backends for the snip URL shortener.
//!
//! Three interchangeable implementations of [`snip_core::Repository`]:
//! an in-memory store, an append-only JSON Lines store and PostgreSQL.

pub mod file;
pub mod memory;
pub mod postgres;
mod tables;

pub use file::FileRepository;
pub use memory::InMemoryRepository;
pub use postgres::{PostgresConfig, PostgresRepository};

use snip_core::error::Result;
use snip_core::Repository;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Selects and configures a storage backend.
#[derive(Debug, Clone)]
pub enum StorageConfig {
    /// Process-local store seeded with a demo record.
    Memory,
    /// JSON Lines files under `dir`.
    File { dir: PathBuf },
    Postgres(PostgresConfig),
}

/// Builds the backend described by `config`.
///
/// The PostgreSQL backend applies its schema before it is returned.
pub async fn connect(config: &StorageConfig) -> Result<Arc<dyn Repository>> {
    let repository: Arc<dyn Repository> = match config {
        StorageConfig::Memory => {
            info!("using in-memory storage");
            Arc::new(InMemoryRepository::new())
        }
        StorageConfig::File { dir } => {
            info!(dir = %dir.display(), "using file storage");
            Arc::new(FileRepository::open(dir).await?)
        }
        StorageConfig::Postgres(postgres) => {
            info!("using postgres storage");
            let repository = PostgresRepository::connect(postgres).await?;
            repository.migrate().await?;
            Arc::new(repository)
        }
    };
    Ok(repository)
}
