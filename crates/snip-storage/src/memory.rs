use crate::tables::Tables;
use async_trait::async_trait;
use jiff::Timestamp;
use parking_lot::RwLock;
use snip_core::error::Result;
use snip_core::{NewUrl, NewUser, Repository, ShortCode, UrlId, UrlRecord, UserRecord};
use tracing::{debug, trace};
use uuid::Uuid;

/// Code of the record every seeded repository starts with.
pub const DEMO_SHORT_CODE: &str = "snipdemo01";
/// Target of the seeded record.
pub const DEMO_URL: &str = "https://www.rust-lang.org/";

/// In-memory implementation of the Repository trait.
///
/// All tables sit behind a single read/write lock: readers proceed
/// concurrently, writers are exclusive. Uniqueness checks run under the
/// write lock together with the write, so two racing inserts of the same
/// URL cannot both succeed. Nothing survives the process.
#[derive(Debug)]
pub struct InMemoryRepository {
    tables: RwLock<Tables>,
}

impl InMemoryRepository {
    /// Creates a repository seeded with one demo record.
    pub fn new() -> Self {
        let mut tables = Tables::default();
        let demo = tables.allocate_urls(
            vec![NewUrl::new(
                ShortCode::new_unchecked(DEMO_SHORT_CODE),
                DEMO_URL,
            )],
            Timestamp::now(),
        );
        for record in demo {
            tables.put_url(record);
        }
        Self {
            tables: RwLock::new(tables),
        }
    }

    /// Creates a repository without the demo record.
    pub fn empty() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
        }
    }
}

impl Default for InMemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn insert(&self, record: NewUrl) -> Result<UrlRecord> {
        let mut tables = self.tables.write();
        tables.check_insert(&record)?;

        let stored = tables
            .allocate_urls(vec![record], Timestamp::now())
            .remove(0);
        tables.put_url(stored.clone());
        trace!(id = stored.id, code = %stored.short_code, "inserted url");
        Ok(stored)
    }

    async fn find_by_short_code(&self, code: &ShortCode) -> Result<Option<UrlRecord>> {
        Ok(self.tables.read().find_by_code(code).cloned())
    }

    async fn find_by_url(&self, original_url: &str) -> Result<Option<UrlRecord>> {
        Ok(self.tables.read().find_by_url(original_url).cloned())
    }

    async fn insert_many(&self, records: Vec<NewUrl>) -> Result<Vec<UrlRecord>> {
        let mut tables = self.tables.write();
        tables.check_batch(&records)?;

        // Repeated URLs are stored as-is; the newest one takes over the index.
        let stored = tables.allocate_urls(records, Timestamp::now());
        for record in &stored {
            tables.put_url(record.clone());
        }
        debug!(count = stored.len(), "inserted url batch");
        Ok(stored)
    }

    async fn create_user(&self, user: NewUser) -> Result<UserRecord> {
        let mut tables = self.tables.write();
        tables.check_user(&user)?;

        let stored = tables.allocate_user(user);
        tables.put_user(stored.clone());
        Ok(stored)
    }

    async fn find_user_by_uuid(&self, uuid: &Uuid) -> Result<Option<UserRecord>> {
        Ok(self.tables.read().user_by_uuid(uuid).cloned())
    }

    async fn find_user_by_login(&self, login: &str) -> Result<Option<UserRecord>> {
        Ok(self.tables.read().user_by_login(login).cloned())
    }

    async fn link_url_to_user(&self, url_id: UrlId, user: &Uuid) -> Result<()> {
        let mut tables = self.tables.write();
        let (user_id, url_id) = tables.resolve_link(url_id, user)?;
        tables.put_link(user_id, url_id);
        Ok(())
    }

    async fn find_urls_by_user(&self, user: &Uuid) -> Result<Vec<UrlRecord>> {
        Ok(self.tables.read().urls_of(user))
    }

    async fn soft_delete(&self, user: &Uuid, codes: &[ShortCode]) -> Result<u64> {
        let mut tables = self.tables.write();

        let marked = tables.deletions(user, codes, Timestamp::now());
        let count = marked.len() as u64;
        for record in marked {
            tables.put_url(record);
        }
        trace!(user = %user, count, "soft deleted urls");
        Ok(count)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn count_urls(&self) -> Result<u64> {
        Ok(self.tables.read().url_count())
    }

    async fn count_users(&self) -> Result<u64> {
        Ok(self.tables.read().user_count())
    }
}
