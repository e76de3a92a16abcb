use crate::error::Result;
use crate::shortcode::ShortCode;
use async_trait::async_trait;
use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Backend-assigned identifier of a URL record.
pub type UrlId = i64;
/// Backend-assigned identifier of a user record.
pub type UserId = i64;

/// A stored URL record in the repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UrlRecord {
    pub id: UrlId,
    pub short_code: ShortCode,
    /// The original URL that was shortened.
    pub original_url: String,
    pub created_at: Timestamp,
    /// Set once by a soft delete, never cleared.
    pub deleted_at: Option<Timestamp>,
}

impl UrlRecord {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// A URL record to be inserted. The backend assigns the id and creation time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewUrl {
    pub short_code: ShortCode,
    pub original_url: String,
}

impl NewUrl {
    pub fn new(short_code: ShortCode, original_url: impl Into<String>) -> Self {
        Self {
            short_code,
            original_url: original_url.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: UserId,
    pub uuid: Uuid,
    pub name: String,
    /// `None` for anonymous users.
    pub login: Option<String>,
    /// Argon2 PHC string; `None` for anonymous users.
    pub password_hash: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewUser {
    pub uuid: Uuid,
    pub name: String,
    pub login: Option<String>,
    pub password_hash: Option<String>,
}

impl NewUser {
    /// A user created implicitly for an anonymous caller.
    pub fn anonymous(uuid: Uuid) -> Self {
        Self {
            uuid,
            name: format!("anonymous-{}", uuid.simple()),
            login: None,
            password_hash: None,
        }
    }

    pub fn registered(
        uuid: Uuid,
        name: impl Into<String>,
        login: impl Into<String>,
        password_hash: impl Into<String>,
    ) -> Self {
        Self {
            uuid,
            name: name.into(),
            login: Some(login.into()),
            password_hash: Some(password_hash.into()),
        }
    }
}

/// The storage capability set shared by every backend.
///
/// Records are never removed: [`Repository::soft_delete`] only stamps
/// `deleted_at`. Lookups by code return deleted records too so callers can
/// tell "gone" apart from "never existed".
#[async_trait]
pub trait Repository: Send + Sync + 'static {
    /// Inserts a new URL record.
    ///
    /// Returns `Err(UrlConflict)` if an active record already maps the same
    /// URL and `Err(CodeConflict)` if an active record already uses the code.
    async fn insert(&self, record: NewUrl) -> Result<UrlRecord>;

    /// Retrieves the record for a short code, deleted or not.
    /// Returns `None` if the code was never stored.
    async fn find_by_short_code(&self, code: &ShortCode) -> Result<Option<UrlRecord>>;

    /// Retrieves the active record for a URL, falling back to the most
    /// recently stored deleted one.
    async fn find_by_url(&self, original_url: &str) -> Result<Option<UrlRecord>>;

    /// Stores a batch without per-record existence checks and returns the
    /// records that now back each input, in input order.
    async fn insert_many(&self, records: Vec<NewUrl>) -> Result<Vec<UrlRecord>>;

    /// Creates a user. Returns `Err(UserConflict)` if the uuid or login is taken.
    async fn create_user(&self, user: NewUser) -> Result<UserRecord>;

    async fn find_user_by_uuid(&self, uuid: &Uuid) -> Result<Option<UserRecord>>;

    async fn find_user_by_login(&self, login: &str) -> Result<Option<UserRecord>>;

    /// Records that `user` owns `url_id`. Linking twice is a no-op.
    /// Returns `Err(NotFound)` if either side does not exist.
    async fn link_url_to_user(&self, url_id: UrlId, user: &Uuid) -> Result<()>;

    /// All records owned by `user`, deleted ones included, ordered by id.
    async fn find_urls_by_user(&self, user: &Uuid) -> Result<Vec<UrlRecord>>;

    /// Marks the given codes deleted if `user` owns them.
    ///
    /// Unknown, foreign and already deleted codes are skipped. Returns the
    /// number of records newly marked.
    async fn soft_delete(&self, user: &Uuid, codes: &[ShortCode]) -> Result<u64>;

    /// Checks that the backend is reachable.
    async fn ping(&self) -> Result<()>;

    async fn count_urls(&self) -> Result<u64>;

    async fn count_users(&self) -> Result<u64>;
}

#[async_trait]
impl<T: Repository + ?Sized> Repository for Arc<T> {
    async fn insert(&self, record: NewUrl) -> Result<UrlRecord> {
        (**self).insert(record).await
    }

    async fn find_by_short_code(&self, code: &ShortCode) -> Result<Option<UrlRecord>> {
        (**self).find_by_short_code(code).await
    }

    async fn find_by_url(&self, original_url: &str) -> Result<Option<UrlRecord>> {
        (**self).find_by_url(original_url).await
    }

    async fn insert_many(&self, records: Vec<NewUrl>) -> Result<Vec<UrlRecord>> {
        (**self).insert_many(records).await
    }

    async fn create_user(&self, user: NewUser) -> Result<UserRecord> {
        (**self).create_user(user).await
    }

    async fn find_user_by_uuid(&self, uuid: &Uuid) -> Result<Option<UserRecord>> {
        (**self).find_user_by_uuid(uuid).await
    }

    async fn find_user_by_login(&self, login: &str) -> Result<Option<UserRecord>> {
        (**self).find_user_by_login(login).await
    }

    async fn link_url_to_user(&self, url_id: UrlId, user: &Uuid) -> Result<()> {
        (**self).link_url_to_user(url_id, user).await
    }

    async fn find_urls_by_user(&self, user: &Uuid) -> Result<Vec<UrlRecord>> {
        (**self).find_urls_by_user(user).await
    }

    async fn soft_delete(&self, user: &Uuid, codes: &[ShortCode]) -> Result<u64> {
        (**self).soft_delete(user, codes).await
    }

    async fn ping(&self) -> Result<()> {
        (**self).ping().await
    }

    async fn count_urls(&self) -> Result<u64> {
        (**self).count_urls().await
    }

    async fn count_users(&self) -> Result<u64> {
        (**self).count_users().await
    }
}
