use crate::error::{AuthError, Result};
use crate::session::{SessionEntry, SessionKey, SessionStore};
use crate::{Authenticator, Principal, PrincipalKind};
use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use async_trait::async_trait;
use jiff::{SignedDuration, Timestamp};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use snip_core::{NewUser, Repository, StorageError, UserId, UserRecord};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Hashes a password with Argon2id and a random salt.
pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| AuthError::PasswordHash(e.to_string()))
}

/// Checks `password` against a PHC hash string.
pub fn verify_password(password: &str, hash: &str) -> Result<bool> {
    let parsed = PasswordHash::new(hash).map_err(|e| AuthError::PasswordHash(e.to_string()))?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Claims {
    sub: String,
    uid: UserId,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginCredentials {
    pub login: String,
    pub password: String,
}

impl LoginCredentials {
    pub fn new(login: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            login: login.into(),
            password: password.into(),
        }
    }
}

/// Login/password identification issuing HS512 JWTs.
pub struct PasswordAuthenticator<R> {
    repository: Arc<R>,
    sessions: Arc<SessionStore>,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    ttl: SignedDuration,
}

impl<R: Repository> PasswordAuthenticator<R> {
    pub fn new(
        repository: Arc<R>,
        sessions: Arc<SessionStore>,
        secret: &[u8],
        ttl: SignedDuration,
    ) -> Self {
        Self {
            repository,
            sessions,
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            ttl,
        }
    }

    /// Creates a user that can log in with `login` and `password`.
    pub async fn register(&self, name: &str, login: &str, password: &str) -> Result<UserRecord> {
        let hash = hash_password(password)?;
        let user = NewUser::registered(Uuid::new_v4(), name, login, hash);
        match self.repository.create_user(user).await {
            Ok(user) => {
                info!(login, user_id = user.id, "registered user");
                Ok(user)
            }
            Err(StorageError::UserConflict(_)) => Err(AuthError::LoginTaken(login.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    fn issue(&self, user: &UserRecord) -> Result<Principal> {
        let now = Timestamp::now();
        let expires_at = now + self.ttl;
        let claims = Claims {
            sub: user.uuid.to_string(),
            uid: user.id,
            iat: now.as_second(),
            exp: expires_at.as_second(),
        };
        let token = encode(&Header::new(Algorithm::HS512), &claims, &self.encoding_key)
            .map_err(|e| AuthError::Signing(e.to_string()))?;

        Ok(Principal {
            uuid: user.uuid,
            user_id: user.id,
            token,
            expires_at,
            kind: PrincipalKind::Login,
            is_new: false,
        })
    }

    /// Resolves a login token, consulting the session store first.
    pub async fn validate(&self, token: &str) -> Result<Principal> {
        let key = SessionKey::token(token);
        if let Some(entry) = self
            .sessions
            .get(&key)
            .filter(|entry| entry.kind == PrincipalKind::Login)
        {
            return Ok(entry.to_principal());
        }

        let mut validation = Validation::new(Algorithm::HS512);
        validation.leeway = 0;
        let claims = decode::<Claims>(token, &self.decoding_key, &validation)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => AuthError::InvalidToken(e.to_string()),
            })?
            .claims;

        let uuid = Uuid::parse_str(&claims.sub)
            .map_err(|e| AuthError::InvalidToken(e.to_string()))?;
        let expires_at = Timestamp::from_second(claims.exp)
            .map_err(|e| AuthError::InvalidToken(e.to_string()))?;
        let principal = Principal {
            uuid,
            user_id: claims.uid,
            token: token.to_owned(),
            expires_at,
            kind: PrincipalKind::Login,
            is_new: false,
        };
        self.sessions.insert(key, SessionEntry::from(&principal));
        Ok(principal)
    }
}

#[async_trait]
impl<R: Repository> Authenticator for PasswordAuthenticator<R> {
    type Credentials = LoginCredentials;

    async fn authenticate(&self, credentials: LoginCredentials) -> Result<Principal> {
        let user = self
            .repository
            .find_user_by_login(&credentials.login)
            .await?
            .ok_or(AuthError::InvalidCredentials)?;
        let hash = user
            .password_hash
            .as_deref()
            .ok_or(AuthError::InvalidCredentials)?;
        if !verify_password(&credentials.password, hash)? {
            debug!(login = %credentials.login, "password mismatch");
            return Err(AuthError::InvalidCredentials);
        }

        let credentials_key = SessionKey::credentials(&credentials.login, hash);
        if let Some(entry) = self.sessions.get(&credentials_key) {
            return Ok(entry.to_principal());
        }

        let principal = self.issue(&user)?;
        let entry = SessionEntry::from(&principal);
        self.sessions
            .insert(SessionKey::token(principal.token.clone()), entry.clone());
        self.sessions.insert(credentials_key, entry);
        info!(login = %credentials.login, user_id = user.id, "issued login token");
        Ok(principal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use snip_storage::InMemoryRepository;

    const SECRET: &[u8] = b"login-test-secret";

    fn authenticator(
        sessions: Arc<SessionStore>,
    ) -> PasswordAuthenticator<InMemoryRepository> {
        PasswordAuthenticator::new(
            Arc::new(InMemoryRepository::empty()),
            sessions,
            SECRET,
            SignedDuration::from_hours(3),
        )
    }

    #[test]
    fn password_hash_verifies() {
        let hash = hash_password("hunter2").unwrap();

        assert!(hash.starts_with("$argon2id$"));
        assert!(verify_password("hunter2", &hash).unwrap());
        assert!(!verify_password("hunter3", &hash).unwrap());
        assert!(verify_password("hunter2", "not a hash").is_err());
    }

    #[tokio::test]
    async fn login_issues_token_and_reuses_session() {
        let sessions = Arc::new(SessionStore::new());
        let auth = authenticator(Arc::clone(&sessions));
        let user = auth.register("Ada", "ada", "hunter2").await.unwrap();

        let first = auth
            .authenticate(LoginCredentials::new("ada", "hunter2"))
            .await
            .unwrap();
        let second = auth
            .authenticate(LoginCredentials::new("ada", "hunter2"))
            .await
            .unwrap();

        assert_eq!(first.uuid, user.uuid);
        assert_eq!(first.user_id, user.id);
        assert_eq!(first.kind, PrincipalKind::Login);
        assert_eq!(second.token, first.token);
        assert_eq!(sessions.len(), 2);
    }

    #[tokio::test]
    async fn wrong_password_and_unknown_login_are_rejected() {
        let auth = authenticator(Arc::new(SessionStore::new()));
        auth.register("Ada", "ada", "hunter2").await.unwrap();

        for credentials in [
            LoginCredentials::new("ada", "wrong"),
            LoginCredentials::new("bob", "hunter2"),
        ] {
            assert!(matches!(
                auth.authenticate(credentials).await,
                Err(AuthError::InvalidCredentials)
            ));
        }
    }

    #[tokio::test]
    async fn duplicate_login_is_taken() {
        let auth = authenticator(Arc::new(SessionStore::new()));
        auth.register("Ada", "ada", "hunter2").await.unwrap();

        let err = auth.register("Other Ada", "ada", "pw").await.unwrap_err();
        assert!(matches!(err, AuthError::LoginTaken(_)));
    }

    #[tokio::test]
    async fn token_validates_without_session() {
        let auth = authenticator(Arc::new(SessionStore::new()));
        let user = auth.register("Ada", "ada", "hunter2").await.unwrap();
        let principal = auth
            .authenticate(LoginCredentials::new("ada", "hunter2"))
            .await
            .unwrap();

        // A second instance shares the secret but not the session store.
        let other = authenticator(Arc::new(SessionStore::new()));
        let validated = other.validate(&principal.token).await.unwrap();

        assert_eq!(validated.uuid, user.uuid);
        assert_eq!(validated.user_id, user.id);
        assert_eq!(validated.expires_at.as_second(), principal.expires_at.as_second());
    }

    #[tokio::test]
    async fn foreign_and_expired_tokens_are_rejected() {
        let auth = authenticator(Arc::new(SessionStore::new()));
        let user = auth.register("Ada", "ada", "hunter2").await.unwrap();

        let forged = PasswordAuthenticator::new(
            Arc::new(InMemoryRepository::empty()),
            Arc::new(SessionStore::new()),
            b"another-secret",
            SignedDuration::from_hours(3),
        )
        .issue(&user)
        .unwrap();
        assert!(matches!(
            auth.validate(&forged.token).await,
            Err(AuthError::InvalidToken(_))
        ));

        let expired = PasswordAuthenticator::new(
            Arc::new(InMemoryRepository::empty()),
            Arc::new(SessionStore::new()),
            SECRET,
            SignedDuration::from_hours(-1),
        )
        .issue(&user)
        .unwrap();
        assert!(matches!(
            auth.validate(&expired.token).await,
            Err(AuthError::Expired)
        ));
    }
}
