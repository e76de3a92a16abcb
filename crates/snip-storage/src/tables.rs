//! In-process tables shared by the memory and file backends.
//!
//! Callers hold their backend's write lock across a check and the matching
//! `put_*`, which makes uniqueness checks atomic with the write.

use jiff::Timestamp;
use snip_core::error::{Result, StorageError};
use snip_core::{NewUrl, NewUser, ShortCode, UrlId, UrlRecord, UserId, UserRecord};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use uuid::Uuid;

#[derive(Debug, Default)]
pub(crate) struct Tables {
    urls: BTreeMap<UrlId, UrlRecord>,
    // Ids per key, ascending.
    by_code: HashMap<ShortCode, Vec<UrlId>>,
    by_url: HashMap<String, Vec<UrlId>>,
    users: BTreeMap<UserId, UserRecord>,
    user_by_uuid: HashMap<Uuid, UserId>,
    user_by_login: HashMap<String, UserId>,
    links: BTreeMap<UserId, BTreeSet<UrlId>>,
}

fn push_sorted(ids: &mut Vec<UrlId>, id: UrlId) {
    if let Err(pos) = ids.binary_search(&id) {
        ids.insert(pos, id);
    }
}

fn remove_id<K: std::hash::Hash + Eq>(index: &mut HashMap<K, Vec<UrlId>>, key: &K, id: UrlId) {
    if let Some(ids) = index.get_mut(key) {
        ids.retain(|existing| *existing != id);
        if ids.is_empty() {
            index.remove(key);
        }
    }
}

impl Tables {
    /// Picks the newest active record among `ids`, else the newest deleted one.
    fn pick<'a>(&'a self, ids: Option<&Vec<UrlId>>) -> Option<&'a UrlRecord> {
        let ids = ids?;
        let mut newest = None;
        for id in ids.iter().rev() {
            let Some(record) = self.urls.get(id) else {
                continue;
            };
            if !record.is_deleted() {
                return Some(record);
            }
            if newest.is_none() {
                newest = Some(record);
            }
        }
        newest
    }

    pub(crate) fn find_by_code(&self, code: &ShortCode) -> Option<&UrlRecord> {
        self.pick(self.by_code.get(code))
    }

    pub(crate) fn find_by_url(&self, original_url: &str) -> Option<&UrlRecord> {
        self.pick(self.by_url.get(original_url))
    }

    /// Rejects `new` if it would duplicate an active URL or code.
    pub(crate) fn check_insert(&self, new: &NewUrl) -> Result<()> {
        if self
            .find_by_url(&new.original_url)
            .is_some_and(|r| !r.is_deleted())
        {
            return Err(StorageError::UrlConflict(new.original_url.clone()));
        }
        if self
            .find_by_code(&new.short_code)
            .is_some_and(|r| !r.is_deleted())
        {
            return Err(StorageError::CodeConflict(new.short_code.to_string()));
        }
        Ok(())
    }

    /// Rejects a batch if any code is active or repeats within the batch.
    /// Repeated URLs are allowed.
    pub(crate) fn check_batch(&self, new: &[NewUrl]) -> Result<()> {
        let mut seen = HashSet::with_capacity(new.len());
        for record in new {
            let active = self
                .find_by_code(&record.short_code)
                .is_some_and(|r| !r.is_deleted());
            if active || !seen.insert(&record.short_code) {
                return Err(StorageError::CodeConflict(record.short_code.to_string()));
            }
        }
        Ok(())
    }

    pub(crate) fn next_url_id(&self) -> UrlId {
        self.urls.last_key_value().map_or(1, |(id, _)| id + 1)
    }

    pub(crate) fn next_user_id(&self) -> UserId {
        self.users.last_key_value().map_or(1, |(id, _)| id + 1)
    }

    /// Builds records for `new` with consecutive ids, without storing them.
    pub(crate) fn allocate_urls(&self, new: Vec<NewUrl>, now: Timestamp) -> Vec<UrlRecord> {
        let first = self.next_url_id();
        new.into_iter()
            .zip(first..)
            .map(|(new, id)| UrlRecord {
                id,
                short_code: new.short_code,
                original_url: new.original_url,
                created_at: now,
                deleted_at: None,
            })
            .collect()
    }

    /// Stores or replaces a record. A stored `deleted_at` is never cleared.
    pub(crate) fn put_url(&mut self, mut record: UrlRecord) {
        let id = record.id;
        if let Some(old) = self.urls.get(&id) {
            record.deleted_at = old.deleted_at.or(record.deleted_at);
            if old.short_code != record.short_code {
                let code = old.short_code.clone();
                remove_id(&mut self.by_code, &code, id);
            }
            if old.original_url != record.original_url {
                let url = old.original_url.clone();
                remove_id(&mut self.by_url, &url, id);
            }
        }
        push_sorted(
            self.by_code.entry(record.short_code.clone()).or_default(),
            id,
        );
        push_sorted(
            self.by_url.entry(record.original_url.clone()).or_default(),
            id,
        );
        self.urls.insert(id, record);
    }

    pub(crate) fn check_user(&self, new: &NewUser) -> Result<()> {
        if self.user_by_uuid.contains_key(&new.uuid) {
            return Err(StorageError::UserConflict(new.uuid.to_string()));
        }
        if let Some(login) = &new.login {
            if self.user_by_login.contains_key(login) {
                return Err(StorageError::UserConflict(login.clone()));
            }
        }
        Ok(())
    }

    pub(crate) fn allocate_user(&self, new: NewUser) -> UserRecord {
        UserRecord {
            id: self.next_user_id(),
            uuid: new.uuid,
            name: new.name,
            login: new.login,
            password_hash: new.password_hash,
        }
    }

    pub(crate) fn put_user(&mut self, user: UserRecord) {
        if let Some(old) = self.users.get(&user.id) {
            self.user_by_uuid.remove(&old.uuid);
            if let Some(login) = &old.login {
                self.user_by_login.remove(login);
            }
        }
        self.user_by_uuid.insert(user.uuid, user.id);
        if let Some(login) = &user.login {
            self.user_by_login.insert(login.clone(), user.id);
        }
        self.users.insert(user.id, user);
    }

    pub(crate) fn user_by_uuid(&self, uuid: &Uuid) -> Option<&UserRecord> {
        self.user_by_uuid
            .get(uuid)
            .and_then(|id| self.users.get(id))
    }

    pub(crate) fn user_by_login(&self, login: &str) -> Option<&UserRecord> {
        self.user_by_login
            .get(login)
            .and_then(|id| self.users.get(id))
    }

    /// Resolves both sides of an ownership link.
    pub(crate) fn resolve_link(&self, url_id: UrlId, user: &Uuid) -> Result<(UserId, UrlId)> {
        let user_id = self
            .user_by_uuid
            .get(user)
            .copied()
            .ok_or_else(|| StorageError::NotFound(format!("user {user}")))?;
        if !self.urls.contains_key(&url_id) {
            return Err(StorageError::NotFound(format!("url {url_id}")));
        }
        Ok((user_id, url_id))
    }

    pub(crate) fn has_link(&self, user_id: UserId, url_id: UrlId) -> bool {
        self.links
            .get(&user_id)
            .is_some_and(|owned| owned.contains(&url_id))
    }

    pub(crate) fn put_link(&mut self, user_id: UserId, url_id: UrlId) {
        self.links.entry(user_id).or_default().insert(url_id);
    }

    pub(crate) fn urls_of(&self, user: &Uuid) -> Vec<UrlRecord> {
        let Some(user_id) = self.user_by_uuid.get(user) else {
            return Vec::new();
        };
        self.links
            .get(user_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.urls.get(id).cloned())
            .collect()
    }

    /// Active records among `codes` that `user` owns, stamped as deleted at `now`.
    pub(crate) fn deletions(
        &self,
        user: &Uuid,
        codes: &[ShortCode],
        now: Timestamp,
    ) -> Vec<UrlRecord> {
        let Some(user_id) = self.user_by_uuid.get(user).copied() else {
            return Vec::new();
        };
        let mut marked: BTreeMap<UrlId, UrlRecord> = BTreeMap::new();
        for code in codes {
            let Some(ids) = self.by_code.get(code) else {
                continue;
            };
            for id in ids {
                if marked.contains_key(id) || !self.has_link(user_id, *id) {
                    continue;
                }
                if let Some(record) = self.urls.get(id).filter(|r| !r.is_deleted()) {
                    let mut record = record.clone();
                    record.deleted_at = Some(now);
                    marked.insert(*id, record);
                }
            }
        }
        marked.into_values().collect()
    }

    pub(crate) fn url_count(&self) -> u64 {
        self.urls.len() as u64
    }

    pub(crate) fn user_count(&self) -> u64 {
        self.users.len() as u64
    }
}
