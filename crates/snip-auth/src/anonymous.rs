use crate::error::{AuthError, Result};
use crate::session::{SessionEntry, SessionKey, SessionStore};
use crate::{Authenticator, Principal, PrincipalKind};
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use jiff::{SignedDuration, Timestamp};
use sha2::Sha256;
use snip_core::{NewUser, Repository, StorageError, UserRecord};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// Signs and checks anonymous session tokens.
///
/// A token reads `base64url(uuid) "." expiry "." base64url(mac)`, where
/// `expiry` is in unix seconds and the MAC is HMAC-SHA256 over
/// `"anon|" uuid "|" expiry`.
#[derive(Clone)]
pub struct TokenSigner {
    key: Vec<u8>,
}

impl std::fmt::Debug for TokenSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSigner").finish_non_exhaustive()
    }
}

impl TokenSigner {
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        Self { key: key.into() }
    }

    fn mac(&self, uuid: &Uuid, expiry: i64) -> Result<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(&self.key)
            .map_err(|e| AuthError::Signing(e.to_string()))?;
        mac.update(format!("anon|{}|{}", uuid, expiry).as_bytes());
        Ok(mac)
    }

    pub fn issue(&self, uuid: &Uuid, expires_at: Timestamp) -> Result<String> {
        let expiry = expires_at.as_second();
        let tag = self.mac(uuid, expiry)?.finalize().into_bytes();
        Ok(format!(
            "{}.{}.{}",
            URL_SAFE_NO_PAD.encode(uuid.as_bytes()),
            expiry,
            URL_SAFE_NO_PAD.encode(tag)
        ))
    }

    /// Checks the signature and expiry of `token` against `now`.
    pub fn validate_at(&self, token: &str, now: Timestamp) -> Result<(Uuid, Timestamp)> {
        let mut parts = token.split('.');
        let (Some(uuid), Some(expiry), Some(tag), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(AuthError::InvalidToken("malformed token".to_string()));
        };

        let uuid = URL_SAFE_NO_PAD
            .decode(uuid)
            .ok()
            .and_then(|bytes| Uuid::from_slice(&bytes).ok())
            .ok_or_else(|| AuthError::InvalidToken("malformed principal".to_string()))?;
        let expiry: i64 = expiry
            .parse()
            .map_err(|_| AuthError::InvalidToken("malformed expiry".to_string()))?;
        let tag = URL_SAFE_NO_PAD
            .decode(tag)
            .map_err(|_| AuthError::InvalidToken("malformed signature".to_string()))?;

        self.mac(&uuid, expiry)?
            .verify_slice(&tag)
            .map_err(|_| AuthError::InvalidToken("bad signature".to_string()))?;

        let expires_at = Timestamp::from_second(expiry)
            .map_err(|_| AuthError::InvalidToken("expiry out of range".to_string()))?;
        if expires_at <= now {
            return Err(AuthError::Expired);
        }
        Ok((uuid, expires_at))
    }

    pub fn validate(&self, token: &str) -> Result<(Uuid, Timestamp)> {
        self.validate_at(token, Timestamp::now())
    }

    /// Validates `token` and checks it was issued to `expected`.
    pub fn validate_for(&self, token: &str, expected: &Uuid) -> Result<Timestamp> {
        let (uuid, expires_at) = self.validate(token)?;
        if uuid != *expected {
            return Err(AuthError::PrincipalMismatch);
        }
        Ok(expires_at)
    }
}

/// Identifies callers that have no account.
///
/// A caller without a usable token becomes a new anonymous user. A caller
/// with a valid token keeps its identity, even if the backend lost the user
/// row in the meantime.
pub struct AnonymousAuthenticator<R> {
    repository: Arc<R>,
    sessions: Arc<SessionStore>,
    signer: TokenSigner,
    ttl: SignedDuration,
}

impl<R: Repository> AnonymousAuthenticator<R> {
    pub fn new(
        repository: Arc<R>,
        sessions: Arc<SessionStore>,
        signer: TokenSigner,
        ttl: SignedDuration,
    ) -> Self {
        Self {
            repository,
            sessions,
            signer,
            ttl,
        }
    }

    pub fn signer(&self) -> &TokenSigner {
        &self.signer
    }

    /// Validates a token for the expected principal.
    pub fn validate_for(&self, token: &str, expected: &Uuid) -> Result<Timestamp> {
        self.signer.validate_for(token, expected)
    }

    async fn issue_new(&self) -> Result<Principal> {
        let uuid = Uuid::new_v4();
        let user = self.repository.create_user(NewUser::anonymous(uuid)).await?;
        let expires_at = Timestamp::now() + self.ttl;
        let principal = Principal {
            uuid,
            user_id: user.id,
            token: self.signer.issue(&uuid, expires_at)?,
            expires_at,
            kind: PrincipalKind::Anonymous,
            is_new: true,
        };
        self.sessions.insert(
            SessionKey::token(principal.token.clone()),
            SessionEntry::from(&principal),
        );
        info!(%uuid, user_id = user.id, "issued anonymous principal");
        Ok(principal)
    }

    async fn resume(&self, token: &str) -> Result<Principal> {
        let (uuid, expires_at) = self.signer.validate(token)?;
        let key = SessionKey::token(token);
        if let Some(entry) = self.sessions.get(&key) {
            return Ok(entry.to_principal());
        }

        let user = self.user_or_recreate(&uuid).await?;
        let principal = Principal {
            uuid,
            user_id: user.id,
            token: token.to_owned(),
            expires_at,
            kind: PrincipalKind::Anonymous,
            is_new: false,
        };
        self.sessions.insert(key, SessionEntry::from(&principal));
        Ok(principal)
    }

    async fn user_or_recreate(&self, uuid: &Uuid) -> Result<UserRecord> {
        if let Some(user) = self.repository.find_user_by_uuid(uuid).await? {
            return Ok(user);
        }
        debug!(%uuid, "recreating user row for valid anonymous token");
        match self.repository.create_user(NewUser::anonymous(*uuid)).await {
            Ok(user) => Ok(user),
            // Another request recreated it first.
            Err(StorageError::UserConflict(_)) => self
                .repository
                .find_user_by_uuid(uuid)
                .await?
                .ok_or_else(|| StorageError::NotFound(format!("user {uuid}")).into()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl<R: Repository> Authenticator for AnonymousAuthenticator<R> {
    /// The bearer token from the previous response, if any.
    type Credentials = Option<String>;

    async fn authenticate(&self, token: Option<String>) -> Result<Principal> {
        if let Some(token) = token {
            match self.resume(&token).await {
                Ok(principal) => return Ok(principal),
                Err(e) if e.is_invalid_token() => {
                    debug!(error = %e, "discarding unusable anonymous token");
                }
                Err(e) => return Err(e),
            }
        }
        self.issue_new().await
    }
}
