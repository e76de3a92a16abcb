use snip_core::StorageError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, AuthError>;

#[derive(Debug, Clone, Error)]
pub enum AuthError {
    #[error("invalid token: {0}")]
    InvalidToken(String),
    #[error("token expired")]
    Expired,
    /// The token is valid but was issued to someone else.
    #[error("token belongs to another principal")]
    PrincipalMismatch,
    #[error("invalid login or password")]
    InvalidCredentials,
    #[error("login already taken: {0}")]
    LoginTaken(String),
    #[error("password hashing failed: {0}")]
    PasswordHash(String),
    #[error("token signing failed: {0}")]
    Signing(String),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

impl AuthError {
    /// Returns `true` when a presented token cannot be used, as opposed to
    /// an infrastructure failure.
    pub fn is_invalid_token(&self) -> bool {
        matches!(
            self,
            AuthError::InvalidToken(_) | AuthError::Expired | AuthError::PrincipalMismatch
        )
    }
}
