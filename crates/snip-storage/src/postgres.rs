use async_trait::async_trait;
use jiff::Timestamp;
use snip_core::error::{Result, StorageError};
use snip_core::{NewUrl, NewUser, Repository, ShortCode, UrlId, UrlRecord, UserRecord};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use std::time::Duration;
use tracing::{debug, info, trace};
use typed_builder::TypedBuilder;
use uuid::Uuid;

/// Schema applied by [`PostgresRepository::migrate`].
pub const SCHEMA: &str = include_str!("../ddl/postgres/schema.sql");

pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, TypedBuilder)]
pub struct PostgresConfig {
    #[builder(setter(into))]
    pub dsn: String,
    #[builder(default = 10)]
    pub max_connections: u32,
    /// Upper bound for [`Repository::ping`].
    #[builder(default = DEFAULT_PING_TIMEOUT)]
    pub ping_timeout: Duration,
}

/// PostgreSQL implementation of the repository contract.
///
/// Soft delete is implemented with `deleted_at`. Uniqueness of active URLs is
/// enforced by a partial unique index (`WHERE deleted_at IS NULL`); a
/// violation surfaces as [`StorageError::UrlConflict`].
#[derive(Debug, Clone)]
pub struct PostgresRepository {
    pool: PgPool,
    ping_timeout: Duration,
}

impl PostgresRepository {
    /// Creates a repository from an existing connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            ping_timeout: DEFAULT_PING_TIMEOUT,
        }
    }

    pub fn with_ping_timeout(mut self, ping_timeout: Duration) -> Self {
        self.ping_timeout = ping_timeout;
        self
    }

    /// Opens a new connection pool.
    pub async fn connect(config: &PostgresConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.dsn)
            .await
            .map_err(map_sqlx_error)?;
        info!(max_connections = config.max_connections, "connected to postgres");
        Ok(Self::new(pool).with_ping_timeout(config.ping_timeout))
    }

    /// Creates the tables and indexes if they do not exist yet.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        debug!("postgres schema is up to date");
        Ok(())
    }

    /// Returns a reference to the underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn parse_timestamp(seconds: i64) -> Result<Timestamp> {
    Timestamp::from_second(seconds).map_err(|e| {
        StorageError::InvalidData(format!("invalid timestamp '{}': {e}", seconds))
    })
}

fn url_from_row(row: &PgRow) -> Result<UrlRecord> {
    let id: i64 = row.try_get("id").map_err(map_sqlx_error)?;
    let short_code: String = row.try_get("short_url").map_err(map_sqlx_error)?;
    let original_url: String = row.try_get("url").map_err(map_sqlx_error)?;
    let created_at: i64 = row.try_get("created_at").map_err(map_sqlx_error)?;
    let deleted_at: Option<i64> = row.try_get("deleted_at").map_err(map_sqlx_error)?;

    Ok(UrlRecord {
        id,
        short_code: ShortCode::new_unchecked(short_code),
        original_url,
        created_at: parse_timestamp(created_at)?,
        deleted_at: deleted_at.map(parse_timestamp).transpose()?,
    })
}

fn user_from_row(row: &PgRow) -> Result<UserRecord> {
    Ok(UserRecord {
        id: row.try_get("id").map_err(map_sqlx_error)?,
        uuid: row.try_get("uuid").map_err(map_sqlx_error)?,
        name: row.try_get("name").map_err(map_sqlx_error)?,
        login: row.try_get("login").map_err(map_sqlx_error)?,
        password_hash: row.try_get("password_hash").map_err(map_sqlx_error)?,
    })
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .is_some_and(sqlx::error::DatabaseError::is_unique_violation)
}

fn is_foreign_key_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .is_some_and(sqlx::error::DatabaseError::is_foreign_key_violation)
}

fn map_sqlx_error(err: sqlx::Error) -> StorageError {
    let message = err.to_string();

    match err {
        sqlx::Error::PoolTimedOut => StorageError::Timeout(message),
        sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed
        | sqlx::Error::Io(_)
        | sqlx::Error::Tls(_) => StorageError::Unavailable(message),
        sqlx::Error::ColumnIndexOutOfBounds { .. }
        | sqlx::Error::ColumnNotFound(_)
        | sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::TypeNotFound { .. }
        | sqlx::Error::Decode(_)
        | sqlx::Error::RowNotFound => StorageError::InvalidData(message),
        _ => StorageError::Query(message),
    }
}

const URL_COLUMNS: &str = "id, short_url, url, created_at, deleted_at";

#[async_trait]
impl Repository for PostgresRepository {
    async fn insert(&self, record: NewUrl) -> Result<UrlRecord> {
        let result = sqlx::query(&format!(
            r#"
            INSERT INTO urls (short_url, url, created_at)
            SELECT $1, $2, $3
            WHERE NOT EXISTS (
                SELECT 1 FROM urls WHERE short_url = $1 AND deleted_at IS NULL
            )
            RETURNING {URL_COLUMNS}
            "#
        ))
        .bind(record.short_code.as_str())
        .bind(&record.original_url)
        .bind(Timestamp::now().as_second())
        .fetch_optional(&self.pool)
        .await;

        match result {
            Ok(Some(row)) => url_from_row(&row),
            Ok(None) => Err(StorageError::CodeConflict(record.short_code.to_string())),
            Err(err) if is_unique_violation(&err) => {
                Err(StorageError::UrlConflict(record.original_url))
            }
            Err(err) => Err(map_sqlx_error(err)),
        }
    }

    async fn find_by_short_code(&self, code: &ShortCode) -> Result<Option<UrlRecord>> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {URL_COLUMNS}
            FROM urls
            WHERE short_url = $1
            ORDER BY (deleted_at IS NULL) DESC, id DESC
            LIMIT 1
            "#
        ))
        .bind(code.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        row.as_ref().map(url_from_row).transpose()
    }

    async fn find_by_url(&self, original_url: &str) -> Result<Option<UrlRecord>> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {URL_COLUMNS}
            FROM urls
            WHERE url = $1
            ORDER BY (deleted_at IS NULL) DESC, id DESC
            LIMIT 1
            "#
        ))
        .bind(original_url)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        row.as_ref().map(url_from_row).transpose()
    }

    async fn insert_many(&self, records: Vec<NewUrl>) -> Result<Vec<UrlRecord>> {
        let now = Timestamp::now().as_second();
        let insert_sql = format!(
            r#"
            INSERT INTO urls (short_url, url, created_at)
            SELECT $1, $2, $3
            WHERE NOT EXISTS (
                SELECT 1 FROM urls WHERE short_url = $1 AND deleted_at IS NULL
            )
            ON CONFLICT (url) WHERE deleted_at IS NULL DO NOTHING
            RETURNING {URL_COLUMNS}
            "#
        );
        let existing_sql = format!(
            r#"
            SELECT {URL_COLUMNS}
            FROM urls
            WHERE url = $1 AND deleted_at IS NULL
            LIMIT 1
            "#
        );

        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;
        let mut stored = Vec::with_capacity(records.len());

        for record in records {
            let inserted = sqlx::query(&insert_sql)
                .bind(record.short_code.as_str())
                .bind(&record.original_url)
                .bind(now)
                .fetch_optional(&mut *tx)
                .await
                .map_err(map_sqlx_error)?;

            let row = match inserted {
                Some(row) => row,
                None => {
                    let existing = sqlx::query(&existing_sql)
                        .bind(&record.original_url)
                        .fetch_optional(&mut *tx)
                        .await
                        .map_err(map_sqlx_error)?;
                    // No active record for the URL, so the code was taken.
                    // Dropping `tx` rolls the batch back.
                    let Some(row) = existing else {
                        return Err(StorageError::CodeConflict(record.short_code.to_string()));
                    };
                    trace!(url = %record.original_url, "batch entry resolved to active record");
                    row
                }
            };
            stored.push(url_from_row(&row)?);
        }

        tx.commit().await.map_err(map_sqlx_error)?;
        debug!(count = stored.len(), "inserted url batch");
        Ok(stored)
    }

    async fn create_user(&self, user: NewUser) -> Result<UserRecord> {
        let result = sqlx::query(
            r#"
            INSERT INTO users (uuid, name, login, password_hash)
            VALUES ($1, $2, $3, $4)
            RETURNING id
            "#,
        )
        .bind(user.uuid)
        .bind(&user.name)
        .bind(&user.login)
        .bind(&user.password_hash)
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok(row) => Ok(UserRecord {
                id: row.try_get("id").map_err(map_sqlx_error)?,
                uuid: user.uuid,
                name: user.name,
                login: user.login,
                password_hash: user.password_hash,
            }),
            Err(err) if is_unique_violation(&err) => Err(StorageError::UserConflict(
                user.login.unwrap_or_else(|| user.uuid.to_string()),
            )),
            Err(err) => Err(map_sqlx_error(err)),
        }
    }

    async fn find_user_by_uuid(&self, uuid: &Uuid) -> Result<Option<UserRecord>> {
        let row = sqlx::query(
            r#"
            SELECT id, uuid, name, login, password_hash
            FROM users
            WHERE uuid = $1
            LIMIT 1
            "#,
        )
        .bind(uuid)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        row.as_ref().map(user_from_row).transpose()
    }

    async fn find_user_by_login(&self, login: &str) -> Result<Option<UserRecord>> {
        let row = sqlx::query(
            r#"
            SELECT id, uuid, name, login, password_hash
            FROM users
            WHERE login = $1 AND deleted_at IS NULL
            LIMIT 1
            "#,
        )
        .bind(login)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        row.as_ref().map(user_from_row).transpose()
    }

    async fn link_url_to_user(&self, url_id: UrlId, user: &Uuid) -> Result<()> {
        let user_id: i64 = sqlx::query_scalar("SELECT id FROM users WHERE uuid = $1")
            .bind(user)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?
            .ok_or_else(|| StorageError::NotFound(format!("user {user}")))?;

        let result = sqlx::query(
            r#"
            INSERT INTO user_urls (user_id, url_id)
            VALUES ($1, $2)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(url_id)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(err) if is_foreign_key_violation(&err) => {
                Err(StorageError::NotFound(format!("url {url_id}")))
            }
            Err(err) => Err(map_sqlx_error(err)),
        }
    }

    async fn find_urls_by_user(&self, user: &Uuid) -> Result<Vec<UrlRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT u.id, u.short_url, u.url, u.created_at, u.deleted_at
            FROM urls u
            JOIN user_urls uu ON uu.url_id = u.id
            JOIN users us ON us.id = uu.user_id
            WHERE us.uuid = $1
            ORDER BY u.id
            "#,
        )
        .bind(user)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        rows.iter().map(url_from_row).collect()
    }

    async fn soft_delete(&self, user: &Uuid, codes: &[ShortCode]) -> Result<u64> {
        let codes: Vec<String> = codes.iter().map(|c| c.as_str().to_owned()).collect();

        let result = sqlx::query(
            r#"
            UPDATE urls
            SET deleted_at = $1
            WHERE short_url = ANY($2)
              AND deleted_at IS NULL
              AND id IN (
                SELECT uu.url_id
                FROM user_urls uu
                JOIN users us ON us.id = uu.user_id
                WHERE us.uuid = $3
              )
            "#,
        )
        .bind(Timestamp::now().as_second())
        .bind(codes)
        .bind(user)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        Ok(result.rows_affected())
    }

    async fn ping(&self) -> Result<()> {
        let check = sqlx::query("SELECT 1").execute(&self.pool);
        match tokio::time::timeout(self.ping_timeout, check).await {
            Ok(result) => result.map(|_| ()).map_err(map_sqlx_error),
            Err(_) => Err(StorageError::Timeout(format!(
                "ping exceeded {:?}",
                self.ping_timeout
            ))),
        }
    }

    async fn count_urls(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM urls")
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(count as u64)
    }

    async fn count_users(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users")
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(count as u64)
    }
}
