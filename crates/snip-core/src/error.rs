use thiserror::Error;

/// Result type for repository operations.
pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Debug, Clone, Error)]
pub enum StorageError {
    /// An active record already maps this original URL.
    #[error("url already shortened: {0}")]
    UrlConflict(String),
    /// An active record already uses this short code.
    #[error("short code already taken: {0}")]
    CodeConflict(String),
    #[error("user already exists: {0}")]
    UserConflict(String),
    /// A referenced user or URL does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    #[error("storage backend unavailable: {0}")]
    Unavailable(String),
    #[error("storage operation timed out: {0}")]
    Timeout(String),
    #[error("storage query failed: {0}")]
    Query(String),
    #[error("stored data is invalid: {0}")]
    InvalidData(String),
    #[error("storage io failed: {0}")]
    Io(String),
}

impl StorageError {
    /// Returns `true` for uniqueness violations, which are expected outcomes
    /// rather than persistence failures.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            StorageError::UrlConflict(_)
                | StorageError::CodeConflict(_)
                | StorageError::UserConflict(_)
        )
    }
}

#[derive(Debug, Clone, Error)]
pub enum ShortenerError {
    #[error("short code not found: {0}")]
    NotFound(String),
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("invalid short code: {0}")]
    InvalidShortCode(String),
    #[error("no free short code after {0} attempts")]
    CodeSpaceExhausted(u32),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}
