use crate::anonymous::{AnonymousAuthenticator, TokenSigner};
use crate::error::{AuthError, Result};
use crate::password::{LoginCredentials, PasswordAuthenticator};
use crate::session::SessionStore;
use crate::{Authenticator, Principal};
use async_trait::async_trait;
use jiff::SignedDuration;
use snip_core::{Repository, UserRecord};
use std::sync::Arc;
use typed_builder::TypedBuilder;
use uuid::Uuid;

pub const DEFAULT_ANONYMOUS_TTL: SignedDuration = SignedDuration::from_hours(30 * 24);
pub const DEFAULT_LOGIN_TTL: SignedDuration = SignedDuration::from_hours(3);

#[derive(Clone, TypedBuilder)]
pub struct AuthConfig {
    /// HMAC key for anonymous session tokens.
    #[builder(setter(into))]
    pub anonymous_secret: String,
    /// JWT signing key for login tokens. Must differ from `anonymous_secret`.
    #[builder(setter(into))]
    pub login_secret: String,
    #[builder(default = DEFAULT_ANONYMOUS_TTL)]
    pub anonymous_ttl: SignedDuration,
    #[builder(default = DEFAULT_LOGIN_TTL)]
    pub login_ttl: SignedDuration,
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("anonymous_ttl", &self.anonymous_ttl)
            .field("login_ttl", &self.login_ttl)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    /// The anonymous token from a previous response, if the caller has one.
    Anonymous(Option<String>),
    Login(LoginCredentials),
    /// A login token issued earlier.
    Bearer(String),
}

/// Both identification strategies over one shared session store.
pub struct AuthManager<R> {
    sessions: Arc<SessionStore>,
    anonymous: AnonymousAuthenticator<R>,
    password: PasswordAuthenticator<R>,
}

impl<R: Repository> AuthManager<R> {
    pub fn new(repository: R, config: AuthConfig) -> Result<Self> {
        if config.anonymous_secret.is_empty() || config.login_secret.is_empty() {
            return Err(AuthError::Signing("secrets must not be empty".to_string()));
        }
        if config.anonymous_secret == config.login_secret {
            return Err(AuthError::Signing(
                "anonymous and login secrets must differ".to_string(),
            ));
        }

        let repository = Arc::new(repository);
        let sessions = Arc::new(SessionStore::new());
        Ok(Self {
            anonymous: AnonymousAuthenticator::new(
                Arc::clone(&repository),
                Arc::clone(&sessions),
                TokenSigner::new(config.anonymous_secret.into_bytes()),
                config.anonymous_ttl,
            ),
            password: PasswordAuthenticator::new(
                repository,
                Arc::clone(&sessions),
                config.login_secret.as_bytes(),
                config.login_ttl,
            ),
            sessions,
        })
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn anonymous(&self) -> &AnonymousAuthenticator<R> {
        &self.anonymous
    }

    pub fn password(&self) -> &PasswordAuthenticator<R> {
        &self.password
    }

    pub async fn register(&self, name: &str, login: &str, password: &str) -> Result<UserRecord> {
        self.password.register(name, login, password).await
    }

    /// Checks that an anonymous token was issued to `expected`.
    pub fn validate_anonymous_for(&self, token: &str, expected: &Uuid) -> Result<()> {
        self.anonymous.validate_for(token, expected).map(|_| ())
    }
}

#[async_trait]
impl<R: Repository> Authenticator for AuthManager<R> {
    type Credentials = Credentials;

    async fn authenticate(&self, credentials: Credentials) -> Result<Principal> {
        match credentials {
            Credentials::Anonymous(token) => self.anonymous.authenticate(token).await,
            Credentials::Login(login) => self.password.authenticate(login).await,
            Credentials::Bearer(token) => self.password.validate(&token).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PrincipalKind;
    use snip_storage::InMemoryRepository;

    fn config() -> AuthConfig {
        AuthConfig::builder()
            .anonymous_secret("anon-secret")
            .login_secret("login-secret")
            .build()
    }

    #[test]
    fn config_defaults() {
        let config = config();
        assert_eq!(config.anonymous_ttl, SignedDuration::from_hours(720));
        assert_eq!(config.login_ttl, SignedDuration::from_hours(3));
        assert!(!format!("{config:?}").contains("anon-secret"));
    }

    #[test]
    fn secrets_must_be_set_and_distinct() {
        let same = AuthConfig::builder()
            .anonymous_secret("same")
            .login_secret("same")
            .build();
        assert!(AuthManager::new(InMemoryRepository::empty(), same).is_err());

        let empty = AuthConfig::builder()
            .anonymous_secret("")
            .login_secret("login")
            .build();
        assert!(AuthManager::new(InMemoryRepository::empty(), empty).is_err());
    }

    #[tokio::test]
    async fn strategies_share_sessions() {
        let manager = AuthManager::new(InMemoryRepository::empty(), config()).unwrap();
        manager.register("Ada", "ada", "hunter2").await.unwrap();

        let anonymous = manager
            .authenticate(Credentials::Anonymous(None))
            .await
            .unwrap();
        let login = manager
            .authenticate(Credentials::Login(LoginCredentials::new("ada", "hunter2")))
            .await
            .unwrap();

        assert_eq!(anonymous.kind, PrincipalKind::Anonymous);
        assert_eq!(login.kind, PrincipalKind::Login);
        // One anonymous token, plus token and credentials keys for the login.
        assert_eq!(manager.sessions().len(), 3);

        let bearer = manager
            .authenticate(Credentials::Bearer(login.token.clone()))
            .await
            .unwrap();
        assert_eq!(bearer.uuid, login.uuid);
    }

    #[tokio::test]
    async fn anonymous_token_is_not_transferable() {
        let manager = AuthManager::new(InMemoryRepository::empty(), config()).unwrap();
        let a = manager
            .authenticate(Credentials::Anonymous(None))
            .await
            .unwrap();
        let b = manager
            .authenticate(Credentials::Anonymous(None))
            .await
            .unwrap();

        assert!(manager.validate_anonymous_for(&a.token, &a.uuid).is_ok());
        assert!(matches!(
            manager.validate_anonymous_for(&a.token, &b.uuid),
            Err(AuthError::PrincipalMismatch)
        ));
    }

    #[tokio::test]
    async fn anonymous_token_is_not_a_login_token() {
        let manager = AuthManager::new(InMemoryRepository::empty(), config()).unwrap();
        let anonymous = manager
            .authenticate(Credentials::Anonymous(None))
            .await
            .unwrap();

        let err = manager
            .authenticate(Credentials::Bearer(anonymous.token))
            .await
            .unwrap_err();
        assert!(err.is_invalid_token());
    }
}
