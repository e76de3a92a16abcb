use crate::repository::{UrlId, UrlRecord};
use crate::shortcode::ShortCode;
use async_trait::async_trait;
use uuid::Uuid;

type Result<T> = std::result::Result<T, crate::error::ShortenerError>;

/// Outcome of encoding a single URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Encoded {
    /// Backend id of the record, usable for ownership links.
    pub id: UrlId,
    pub short_code: ShortCode,
    /// `true` if the URL was already shortened and the existing code was returned.
    pub existed: bool,
}

/// Outcome of resolving a short code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded {
    pub original_url: String,
    /// The record was soft-deleted; callers usually answer "gone".
    pub deleted: bool,
}

/// Aggregate counts reported by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Stats {
    pub urls: u64,
    pub users: u64,
}

#[async_trait]
pub trait Shortener: Send + Sync + 'static {
    /// Returns the code for `url`, reusing the active one if present.
    async fn encode(&self, url: &str) -> Result<Encoded>;

    /// Encodes `url` and records `user` as one of its owners.
    async fn encode_for(&self, user: &Uuid, url: &str) -> Result<Encoded>;

    /// Resolves a short code. Fails with `NotFound` if it never existed.
    async fn decode(&self, code: &ShortCode) -> Result<Decoded>;

    /// Encodes a list of URLs at once, optionally linking them to `owner`.
    async fn encode_batch(
        &self,
        urls: &[String],
        owner: Option<&Uuid>,
    ) -> Result<Vec<(String, ShortCode)>>;

    /// All URLs owned by `user`.
    async fn urls_of(&self, user: &Uuid) -> Result<Vec<UrlRecord>>;
}
