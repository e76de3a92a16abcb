use clap::{Parser, ValueEnum};
use snip_shortener::deletion::{DEFAULT_QUEUE_CAPACITY, DEFAULT_WORKERS};
use snip_shortener::service::DEFAULT_MAX_CODE_ATTEMPTS;
use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use std::time::Duration;

pub const BASE_URL_ENV: &str = "SNIP_BASE_URL";
pub const STORAGE_BACKEND_ENV: &str = "SNIP_STORAGE_BACKEND";
pub const FILE_DIR_ENV: &str = "SNIP_FILE_DIR";
pub const POSTGRES_DSN_ENV: &str = "SNIP_POSTGRES_DSN";
pub const POSTGRES_MAX_CONNECTIONS_ENV: &str = "SNIP_POSTGRES_MAX_CONNECTIONS";
pub const PING_TIMEOUT_ENV: &str = "SNIP_PING_TIMEOUT_MS";
pub const POOL_WORKERS_ENV: &str = "SNIP_DELETION_WORKERS";
pub const POOL_CAPACITY_ENV: &str = "SNIP_DELETION_QUEUE_CAPACITY";
pub const MAX_CODE_ATTEMPTS_ENV: &str = "SNIP_MAX_CODE_ATTEMPTS";
pub const ANONYMOUS_SECRET_ENV: &str = "SNIP_ANONYMOUS_SECRET";
pub const LOGIN_SECRET_ENV: &str = "SNIP_LOGIN_SECRET";
pub const LOG_FORMAT_ENV: &str = "SNIP_LOG_FORMAT";

pub const DEFAULT_BASE_URL: &str = "http://localhost:8080";
pub const DEFAULT_FILE_DIR: &str = "./data";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StorageBackendArg {
    #[value(name = "memory")]
    Memory,
    #[value(name = "file")]
    File,
    #[value(name = "postgres")]
    Postgres,
}

impl Display for StorageBackendArg {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageBackendArg::Memory => write!(f, "memory"),
            StorageBackendArg::File => write!(f, "file"),
            StorageBackendArg::Postgres => write!(f, "postgres"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "snip-server")]
pub struct CLI {
    #[arg(long, env = BASE_URL_ENV, default_value = DEFAULT_BASE_URL)]
    pub base_url: String,

    #[arg(
        long,
        env = STORAGE_BACKEND_ENV,
        value_enum,
        default_value_t = StorageBackendArg::Memory
    )]
    pub storage: StorageBackendArg,

    #[arg(long, env = FILE_DIR_ENV, default_value = DEFAULT_FILE_DIR)]
    pub file_dir: PathBuf,

    #[arg(long, env = POSTGRES_DSN_ENV, required_if_eq("storage", "postgres"))]
    pub postgres_dsn: Option<String>,

    #[arg(long, env = POSTGRES_MAX_CONNECTIONS_ENV, default_value_t = 10)]
    pub postgres_max_connections: u32,

    /// Upper bound for the storage connectivity check, in milliseconds.
    #[arg(long, env = PING_TIMEOUT_ENV, default_value_t = 2_000)]
    pub ping_timeout_ms: u64,

    #[arg(long, env = POOL_WORKERS_ENV, default_value_t = DEFAULT_WORKERS)]
    pub deletion_workers: usize,

    #[arg(long, env = POOL_CAPACITY_ENV, default_value_t = DEFAULT_QUEUE_CAPACITY)]
    pub deletion_queue_capacity: usize,

    #[arg(long, env = MAX_CODE_ATTEMPTS_ENV, default_value_t = DEFAULT_MAX_CODE_ATTEMPTS)]
    pub max_code_attempts: u32,

    #[arg(long, env = ANONYMOUS_SECRET_ENV, hide_env_values = true)]
    pub anonymous_secret: String,

    #[arg(long, env = LOGIN_SECRET_ENV, hide_env_values = true)]
    pub login_secret: String,

    #[arg(long, env = LOG_FORMAT_ENV, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

impl CLI {
    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }
}
