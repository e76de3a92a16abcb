//! Caller identification for the snip URL shortener.
//!
//! Two strategies share one [`SessionStore`]: anonymous callers get an
//! HMAC-signed session token, registered users log in with a password and
//! receive a JWT.

pub mod anonymous;
pub mod error;
pub mod manager;
pub mod password;
pub mod session;

pub use anonymous::{AnonymousAuthenticator, TokenSigner};
pub use error::{AuthError, Result};
pub use manager::{AuthConfig, AuthManager, Credentials};
pub use password::{LoginCredentials, PasswordAuthenticator};
pub use session::{SessionEntry, SessionKey, SessionStore};

use async_trait::async_trait;
use jiff::Timestamp;
use snip_core::UserId;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrincipalKind {
    Anonymous,
    Login,
}

/// An identified caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub uuid: Uuid,
    pub user_id: UserId,
    /// Token to present on the next request.
    pub token: String,
    pub expires_at: Timestamp,
    pub kind: PrincipalKind,
    /// The user record was created by this call.
    pub is_new: bool,
}

/// Turns caller credentials into a [`Principal`].
#[async_trait]
pub trait Authenticator: Send + Sync {
    type Credentials: Send;

    async fn authenticate(&self, credentials: Self::Credentials) -> Result<Principal>;
}
