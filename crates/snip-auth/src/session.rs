use crate::{Principal, PrincipalKind};
use dashmap::DashMap;
use jiff::Timestamp;
use sha2::{Digest, Sha256};
use snip_core::UserId;
use uuid::Uuid;

/// Lookup key of a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SessionKey {
    /// SHA-256 of `login ":" password_hash`.
    Credentials([u8; 32]),
    Token(String),
}

impl SessionKey {
    pub fn credentials(login: &str, password_hash: &str) -> Self {
        let digest = Sha256::new()
            .chain_update(login.as_bytes())
            .chain_update(b":")
            .chain_update(password_hash.as_bytes())
            .finalize();
        SessionKey::Credentials(digest.into())
    }

    pub fn token(token: impl Into<String>) -> Self {
        SessionKey::Token(token.into())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEntry {
    pub uuid: Uuid,
    pub user_id: UserId,
    pub token: String,
    pub expires_at: Timestamp,
    pub kind: PrincipalKind,
}

impl SessionEntry {
    pub fn is_expired_at(&self, now: Timestamp) -> bool {
        self.expires_at <= now
    }

    pub fn to_principal(&self) -> Principal {
        Principal {
            uuid: self.uuid,
            user_id: self.user_id,
            token: self.token.clone(),
            expires_at: self.expires_at,
            kind: self.kind,
            is_new: false,
        }
    }
}

impl From<&Principal> for SessionEntry {
    fn from(principal: &Principal) -> Self {
        Self {
            uuid: principal.uuid,
            user_id: principal.user_id,
            token: principal.token.clone(),
            expires_at: principal.expires_at,
            kind: principal.kind,
        }
    }
}

/// Process-local session map.
///
/// Entries expire lazily: an expired entry is removed by the lookup that
/// finds it. Nothing is persisted.
#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: DashMap<SessionKey, SessionEntry>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: SessionKey, entry: SessionEntry) {
        self.sessions.insert(key, entry);
    }

    pub fn get(&self, key: &SessionKey) -> Option<SessionEntry> {
        self.get_at(key, Timestamp::now())
    }

    /// Like [`SessionStore::get`], judging expiry against `now`.
    pub fn get_at(&self, key: &SessionKey, now: Timestamp) -> Option<SessionEntry> {
        let entry = self.sessions.get(key)?.value().clone();
        if !entry.is_expired_at(now) {
            return Some(entry);
        }
        self.sessions
            .remove_if(key, |_, stored| stored.is_expired_at(now));
        None
    }

    pub fn remove(&self, key: &SessionKey) -> Option<SessionEntry> {
        self.sessions.remove(key).map(|(_, entry)| entry)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
