use crate::tables::Tables;
use async_trait::async_trait;
use jiff::Timestamp;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use snip_core::error::{Result, StorageError};
use snip_core::{NewUrl, NewUser, Repository, ShortCode, UrlId, UrlRecord, UserId, UserRecord};
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

pub const URLS_FILE: &str = "urls.jsonl";
pub const USERS_FILE: &str = "users.jsonl";
pub const LINKS_FILE: &str = "links.jsonl";

/// One line of `urls.jsonl`.
#[derive(Debug, Serialize, Deserialize)]
struct UrlLine {
    id: UrlId,
    short_url: ShortCode,
    url: String,
    #[serde(default)]
    created_at: Option<Timestamp>,
    #[serde(default)]
    deleted_at: Option<Timestamp>,
}

impl From<&UrlRecord> for UrlLine {
    fn from(record: &UrlRecord) -> Self {
        Self {
            id: record.id,
            short_url: record.short_code.clone(),
            url: record.original_url.clone(),
            created_at: Some(record.created_at),
            deleted_at: record.deleted_at,
        }
    }
}

impl From<UrlLine> for UrlRecord {
    fn from(line: UrlLine) -> Self {
        Self {
            id: line.id,
            short_code: line.short_url,
            original_url: line.url,
            created_at: line.created_at.unwrap_or(Timestamp::UNIX_EPOCH),
            deleted_at: line.deleted_at,
        }
    }
}

/// One line of `links.jsonl`.
#[derive(Debug, Serialize, Deserialize)]
struct LinkLine {
    user_id: UserId,
    url_id: UrlId,
}

#[derive(Debug)]
struct FileState {
    tables: Tables,
    urls: File,
    users: File,
    links: File,
}

/// Append-only JSON-lines implementation of the Repository trait.
///
/// Every mutation appends one line per touched record; soft deletes append
/// the record again with `deleted_at` set. On open, all three logs are
/// replayed in file order into an in-memory cache (last line for an id wins)
/// which then serves all reads.
///
/// Writers hold the state's write lock across the check, the append and
/// the cache update, so appends never interleave.
#[derive(Debug)]
pub struct FileRepository {
    dir: PathBuf,
    state: RwLock<FileState>,
}

fn io_error(path: &Path, err: std::io::Error) -> StorageError {
    StorageError::Io(format!("{}: {err}", path.display()))
}

async fn read_lines<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let content = match tokio::fs::read(path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(io_error(path, err)),
    };

    // Bytes after the last newline belong to an append that never finished.
    let split = content
        .iter()
        .rposition(|byte| *byte == b'\n')
        .map_or(0, |pos| pos + 1);
    let (complete, tail) = content.split_at(split);

    let complete = std::str::from_utf8(complete)
        .map_err(|e| StorageError::InvalidData(format!("{}: {e}", path.display())))?;
    let mut lines = complete
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(index, line)| {
            serde_json::from_str(line).map_err(|e| {
                StorageError::InvalidData(format!("{}:{}: {e}", path.display(), index + 1))
            })
        })
        .collect::<Result<Vec<T>>>()?;

    if tail.iter().all(u8::is_ascii_whitespace) {
        return Ok(lines);
    }
    match serde_json::from_slice(tail) {
        Ok(line) => {
            lines.push(line);
            terminate_log(path).await?;
        }
        Err(e) => {
            warn!(
                path = %path.display(),
                line = complete.lines().count() + 1,
                bytes = tail.len(),
                error = %e,
                "discarding torn final line"
            );
            truncate_log(path, split as u64).await?;
        }
    }
    Ok(lines)
}

/// Ends a complete but unterminated final line so the next append starts fresh.
async fn terminate_log(path: &Path) -> Result<()> {
    let mut file = open_log(path).await?;
    file.write_all(b"\n").await.map_err(|e| io_error(path, e))?;
    file.flush().await.map_err(|e| io_error(path, e))
}

async fn truncate_log(path: &Path, len: u64) -> Result<()> {
    let file = OpenOptions::new()
        .write(true)
        .open(path)
        .await
        .map_err(|e| io_error(path, e))?;
    file.set_len(len).await.map_err(|e| io_error(path, e))?;
    file.sync_all().await.map_err(|e| io_error(path, e))
}

async fn open_log(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(|e| io_error(path, e))
}

async fn append<T: Serialize>(file: &mut File, lines: &[T]) -> Result<()> {
    if lines.is_empty() {
        return Ok(());
    }

    let mut buf = String::new();
    for line in lines {
        let json = serde_json::to_string(line)
            .map_err(|e| StorageError::InvalidData(format!("cannot encode line: {e}")))?;
        buf.push_str(&json);
        buf.push('\n');
    }

    file.write_all(buf.as_bytes())
        .await
        .map_err(|e| StorageError::Io(e.to_string()))?;
    file.flush()
        .await
        .map_err(|e| StorageError::Io(e.to_string()))
}

impl FileRepository {
    /// Opens (creating if needed) the logs under `dir` and replays them.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| io_error(&dir, e))?;

        let urls_path = dir.join(URLS_FILE);
        let users_path = dir.join(USERS_FILE);
        let links_path = dir.join(LINKS_FILE);

        let mut tables = Tables::default();

        let url_lines: Vec<UrlLine> = read_lines(&urls_path).await?;
        let url_line_count = url_lines.len();
        for line in url_lines {
            tables.put_url(line.into());
        }

        let user_lines: Vec<UserRecord> = read_lines(&users_path).await?;
        for user in user_lines {
            tables.put_user(user);
        }

        let link_lines: Vec<LinkLine> = read_lines(&links_path).await?;
        for link in link_lines {
            tables.put_link(link.user_id, link.url_id);
        }

        info!(
            dir = %dir.display(),
            url_lines = url_line_count,
            urls = tables.url_count(),
            users = tables.user_count(),
            "replayed file storage"
        );

        let state = FileState {
            tables,
            urls: open_log(&urls_path).await?,
            users: open_log(&users_path).await?,
            links: open_log(&links_path).await?,
        };

        Ok(Self {
            dir,
            state: RwLock::new(state),
        })
    }

    /// Directory holding the logs.
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl Repository for FileRepository {
    async fn insert(&self, record: NewUrl) -> Result<UrlRecord> {
        let mut guard = self.state.write().await;
        let FileState { tables, urls, .. } = &mut *guard;
        tables.check_insert(&record)?;

        let stored = tables
            .allocate_urls(vec![record], Timestamp::now())
            .remove(0);
        append(urls, &[UrlLine::from(&stored)]).await?;
        tables.put_url(stored.clone());
        trace!(id = stored.id, code = %stored.short_code, "appended url");
        Ok(stored)
    }

    async fn find_by_short_code(&self, code: &ShortCode) -> Result<Option<UrlRecord>> {
        Ok(self.state.read().await.tables.find_by_code(code).cloned())
    }

    async fn find_by_url(&self, original_url: &str) -> Result<Option<UrlRecord>> {
        Ok(self
            .state
            .read()
            .await
            .tables
            .find_by_url(original_url)
            .cloned())
    }

    async fn insert_many(&self, records: Vec<NewUrl>) -> Result<Vec<UrlRecord>> {
        let mut guard = self.state.write().await;
        let FileState { tables, urls, .. } = &mut *guard;
        tables.check_batch(&records)?;

        let stored = tables.allocate_urls(records, Timestamp::now());
        let lines: Vec<UrlLine> = stored.iter().map(UrlLine::from).collect();
        append(urls, &lines).await?;
        for record in &stored {
            tables.put_url(record.clone());
        }
        debug!(count = stored.len(), "appended url batch");
        Ok(stored)
    }

    async fn create_user(&self, user: NewUser) -> Result<UserRecord> {
        let mut guard = self.state.write().await;
        let FileState { tables, users, .. } = &mut *guard;
        tables.check_user(&user)?;

        let stored = tables.allocate_user(user);
        append(users, std::slice::from_ref(&stored)).await?;
        tables.put_user(stored.clone());
        Ok(stored)
    }

    async fn find_user_by_uuid(&self, uuid: &Uuid) -> Result<Option<UserRecord>> {
        Ok(self.state.read().await.tables.user_by_uuid(uuid).cloned())
    }

    async fn find_user_by_login(&self, login: &str) -> Result<Option<UserRecord>> {
        Ok(self.state.read().await.tables.user_by_login(login).cloned())
    }

    async fn link_url_to_user(&self, url_id: UrlId, user: &Uuid) -> Result<()> {
        let mut guard = self.state.write().await;
        let FileState { tables, links, .. } = &mut *guard;

        let (user_id, url_id) = tables.resolve_link(url_id, user)?;
        if tables.has_link(user_id, url_id) {
            return Ok(());
        }
        append(links, &[LinkLine { user_id, url_id }]).await?;
        tables.put_link(user_id, url_id);
        Ok(())
    }

    async fn find_urls_by_user(&self, user: &Uuid) -> Result<Vec<UrlRecord>> {
        Ok(self.state.read().await.tables.urls_of(user))
    }

    async fn soft_delete(&self, user: &Uuid, codes: &[ShortCode]) -> Result<u64> {
        let mut guard = self.state.write().await;
        let FileState { tables, urls, .. } = &mut *guard;

        let marked = tables.deletions(user, codes, Timestamp::now());
        let lines: Vec<UrlLine> = marked.iter().map(UrlLine::from).collect();
        append(urls, &lines).await?;

        let count = marked.len() as u64;
        for record in marked {
            tables.put_url(record);
        }
        trace!(user = %user, count, "appended soft deletes");
        Ok(count)
    }

    async fn ping(&self) -> Result<()> {
        let metadata = tokio::fs::metadata(&self.dir)
            .await
            .map_err(|e| StorageError::Unavailable(format!("{}: {e}", self.dir.display())))?;
        if !metadata.is_dir() {
            return Err(StorageError::Unavailable(format!(
                "{} is not a directory",
                self.dir.display()
            )));
        }
        Ok(())
    }

    async fn count_urls(&self) -> Result<u64> {
        Ok(self.state.read().await.tables.url_count())
    }

    async fn count_users(&self) -> Result<u64> {
        Ok(self.state.read().await.tables.user_count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn code(s: &str) -> ShortCode {
        ShortCode::new_unchecked(s)
    }

    fn record(c: &str, url: &str) -> NewUrl {
        NewUrl::new(code(c), url)
    }

    #[tokio::test]
    async fn open_creates_empty_logs() {
        let dir = TempDir::new().unwrap();
        let repo = FileRepository::open(dir.path().join("data")).await.unwrap();

        assert_eq!(repo.count_urls().await.unwrap(), 0);
        assert!(repo.dir().join(URLS_FILE).exists());
        assert!(repo.dir().join(USERS_FILE).exists());
        assert!(repo.dir().join(LINKS_FILE).exists());
        repo.ping().await.unwrap();
    }

    #[tokio::test]
    async fn reopen_replays_everything() {
        let dir = TempDir::new().unwrap();
        let user = Uuid::new_v4();

        {
            let repo = FileRepository::open(dir.path()).await.unwrap();
            repo.create_user(NewUser::anonymous(user)).await.unwrap();
            let kept = repo.insert(record("keep0001", "https://keep.example")).await.unwrap();
            let gone = repo.insert(record("gone0001", "https://gone.example")).await.unwrap();
            repo.link_url_to_user(kept.id, &user).await.unwrap();
            repo.link_url_to_user(gone.id, &user).await.unwrap();
            repo.soft_delete(&user, &[code("gone0001")]).await.unwrap();
        }

        let repo = FileRepository::open(dir.path()).await.unwrap();
        assert_eq!(repo.count_urls().await.unwrap(), 2);
        assert_eq!(repo.count_users().await.unwrap(), 1);

        let kept = repo.find_by_short_code(&code("keep0001")).await.unwrap().unwrap();
        let gone = repo.find_by_short_code(&code("gone0001")).await.unwrap().unwrap();
        assert!(!kept.is_deleted());
        assert!(gone.is_deleted());
        assert_eq!(repo.find_urls_by_user(&user).await.unwrap().len(), 2);

        // Ids continue after the replayed ones.
        let next = repo.insert(record("next0001", "https://next.example")).await.unwrap();
        assert_eq!(next.id, 3);
    }

    #[tokio::test]
    async fn soft_delete_appends_a_line() {
        let dir = TempDir::new().unwrap();
        let repo = FileRepository::open(dir.path()).await.unwrap();
        let user = Uuid::new_v4();
        repo.create_user(NewUser::anonymous(user)).await.unwrap();
        let stored = repo.insert(record("abc123", "https://example.com")).await.unwrap();
        repo.link_url_to_user(stored.id, &user).await.unwrap();

        repo.soft_delete(&user, &[code("abc123")]).await.unwrap();

        let content = std::fs::read_to_string(dir.path().join(URLS_FILE)).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("\"short_url\":\"abc123\""));
        assert!(lines[1].contains("\"deleted_at\":\""));
    }

    #[tokio::test]
    async fn replay_reads_hand_written_lines() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join(URLS_FILE),
            concat!(
                "{\"id\":1,\"short_url\":\"abc123\",\"url\":\"https://old.example\",\"deleted_at\":null}\n",
                "\n",
                "{\"id\":2,\"short_url\":\"def456\",\"url\":\"https://new.example\",\"deleted_at\":null}\n",
            ),
        )
        .unwrap();

        let repo = FileRepository::open(dir.path()).await.unwrap();

        let found = repo.find_by_url("https://new.example").await.unwrap().unwrap();
        assert_eq!(found.id, 2);
        assert_eq!(found.created_at, Timestamp::UNIX_EPOCH);
    }

    #[tokio::test]
    async fn malformed_line_fails_open() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(USERS_FILE), "{not json}\n").unwrap();

        let err = FileRepository::open(dir.path()).await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidData(message) if message.contains(":1:")));
    }

    #[tokio::test]
    async fn torn_final_line_is_dropped_on_open() {
        let dir = TempDir::new().unwrap();
        {
            let repo = FileRepository::open(dir.path()).await.unwrap();
            repo.insert(record("abc123", "https://kept.example")).await.unwrap();
        }
        let path = dir.path().join(URLS_FILE);
        let mut content = std::fs::read_to_string(&path).unwrap();
        content.push_str("{\"id\":2,\"short_url\":\"def4");
        std::fs::write(&path, &content).unwrap();

        let repo = FileRepository::open(dir.path()).await.unwrap();
        assert_eq!(repo.count_urls().await.unwrap(), 1);
        assert!(repo.find_by_short_code(&code("abc123")).await.unwrap().is_some());

        // The torn bytes are gone, so new appends land on their own line.
        let next = repo.insert(record("def456", "https://next.example")).await.unwrap();
        assert_eq!(next.id, 2);
        drop(repo);
        let repo = FileRepository::open(dir.path()).await.unwrap();
        assert_eq!(repo.count_urls().await.unwrap(), 2);
        assert_eq!(std::fs::read_to_string(&path).unwrap().lines().count(), 2);
    }

    #[tokio::test]
    async fn unterminated_complete_line_is_kept() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join(URLS_FILE),
            "{\"id\":1,\"short_url\":\"abc123\",\"url\":\"https://a.example\"}",
        )
        .unwrap();

        let repo = FileRepository::open(dir.path()).await.unwrap();
        repo.insert(record("def456", "https://b.example")).await.unwrap();
        drop(repo);

        let repo = FileRepository::open(dir.path()).await.unwrap();
        assert_eq!(repo.count_urls().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn malformed_line_before_the_end_fails_open() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join(URLS_FILE),
            concat!(
                "{\"id\":1,\"short_url\":\"abc",
                "\n",
                "{\"id\":2,\"short_url\":\"def456\",\"url\":\"https://b.example\"}\n",
            ),
        )
        .unwrap();

        let err = FileRepository::open(dir.path()).await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidData(message) if message.contains(":1:")));
    }

    #[tokio::test]
    async fn insert_conflicts_like_memory() {
        let dir = TempDir::new().unwrap();
        let repo = FileRepository::open(dir.path()).await.unwrap();

        repo.insert(record("abc123", "https://example.com")).await.unwrap();
        let err = repo
            .insert(record("zzz999", "https://example.com"))
            .await
            .unwrap_err();

        assert!(matches!(err, StorageError::UrlConflict(_)));
    }
}
