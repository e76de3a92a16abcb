use async_trait::async_trait;
use snip_core::{
    Decoded, Encoded, NewUrl, Repository, ShortCode, Shortener, ShortenerError, Stats,
    StorageError, UrlRecord,
};
use snip_generator::Generator;
use std::sync::Arc;
use tracing::{debug, trace};
use typed_builder::TypedBuilder;
use url::Url;
use uuid::Uuid;

pub const DEFAULT_BASE_URL: &str = "http://localhost:8080";
pub const DEFAULT_MAX_CODE_ATTEMPTS: u32 = 8;

type Result<T> = std::result::Result<T, ShortenerError>;

#[derive(Debug, Clone, TypedBuilder)]
pub struct ShortenerConfig {
    /// Prefix used by [`ShortenerService::short_url`].
    #[builder(default = DEFAULT_BASE_URL.to_string(), setter(into))]
    pub base_url: String,
    /// How many fresh codes to try when a generated code collides.
    #[builder(default = DEFAULT_MAX_CODE_ATTEMPTS)]
    pub max_code_attempts: u32,
}

impl Default for ShortenerConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// A concrete implementation of the `Shortener` trait.
///
/// This service wraps a `Repository` and a `Generator` to handle:
/// - URL validation
/// - Duplicate resolution (an active URL keeps its code)
/// - Retrying generated codes that collide with an active one
/// - Ownership links for identified callers
#[derive(Debug)]
pub struct ShortenerService<R, G> {
    repository: Arc<R>,
    generator: Arc<G>,
    config: ShortenerConfig,
}

impl<R, G> Clone for ShortenerService<R, G> {
    fn clone(&self) -> Self {
        Self {
            repository: Arc::clone(&self.repository),
            generator: Arc::clone(&self.generator),
            config: self.config.clone(),
        }
    }
}

impl<R: Repository, G: Generator> ShortenerService<R, G> {
    pub fn new(repository: R, generator: G, config: ShortenerConfig) -> Self {
        Self {
            repository: Arc::new(repository),
            generator: Arc::new(generator),
            config,
        }
    }

    /// Validates that the URL is an absolute http(s) URL with a host.
    fn validate_url(url: &str) -> Result<()> {
        if url.is_empty() {
            return Err(ShortenerError::InvalidUrl(
                "URL cannot be empty".to_string(),
            ));
        }

        let parsed = Url::parse(url)
            .map_err(|e| ShortenerError::InvalidUrl(format!("{}: {}", url, e)))?;

        match parsed.scheme() {
            "http" | "https" => {}
            scheme => {
                return Err(ShortenerError::InvalidUrl(format!(
                    "URL scheme must be http or https: {}",
                    scheme
                )))
            }
        }

        match parsed.host_str() {
            Some(host) if !host.is_empty() => Ok(()),
            _ => Err(ShortenerError::InvalidUrl(format!(
                "URL must have a host: {}",
                url
            ))),
        }
    }

    fn generate_code(&self) -> ShortCode {
        self.generator.generate().into()
    }

    fn existing(record: UrlRecord) -> Encoded {
        Encoded {
            id: record.id,
            short_code: record.short_code,
            existed: true,
        }
    }

    /// Stores `url` under a fresh code.
    ///
    /// A `UrlConflict` means a concurrent caller stored the URL first; the
    /// active record is returned instead.
    async fn store(&self, url: &str) -> Result<Encoded> {
        for attempt in 1..=self.config.max_code_attempts {
            let short_code = self.generate_code();
            match self
                .repository
                .insert(NewUrl::new(short_code, url))
                .await
            {
                Ok(record) => {
                    debug!(short_code = %record.short_code, id = record.id, "stored new url");
                    return Ok(Encoded {
                        id: record.id,
                        short_code: record.short_code,
                        existed: false,
                    });
                }
                Err(StorageError::UrlConflict(_)) => {
                    if let Some(record) = self.active_record(url).await? {
                        return Ok(Self::existing(record));
                    }
                    trace!(attempt, "url conflict without an active record, retrying");
                }
                Err(StorageError::CodeConflict(code)) => {
                    debug!(attempt, short_code = %code, "generated code collided, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(ShortenerError::CodeSpaceExhausted(self.config.max_code_attempts))
    }

    /// Stores `urls` under fresh codes, redrawing every code when one of
    /// them collides with an active record.
    async fn store_batch(&self, urls: &[String]) -> Result<Vec<UrlRecord>> {
        for attempt in 1..=self.config.max_code_attempts {
            let batch = urls
                .iter()
                .map(|url| NewUrl::new(self.generate_code(), url.as_str()))
                .collect();
            match self.repository.insert_many(batch).await {
                Ok(stored) => return Ok(stored),
                Err(StorageError::CodeConflict(code)) => {
                    debug!(attempt, short_code = %code, "batch code collided, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(ShortenerError::CodeSpaceExhausted(self.config.max_code_attempts))
    }

    async fn active_record(&self, url: &str) -> Result<Option<UrlRecord>> {
        Ok(self
            .repository
            .find_by_url(url)
            .await?
            .filter(|record| !record.is_deleted()))
    }

    /// Renders the public short URL for `code`.
    pub fn short_url(&self, code: &ShortCode) -> String {
        code.to_url(&self.config.base_url)
    }

    pub async fn stats(&self) -> Result<Stats> {
        Ok(Stats {
            urls: self.repository.count_urls().await?,
            users: self.repository.count_users().await?,
        })
    }

    /// Checks that the storage backend is reachable.
    pub async fn ping(&self) -> Result<()> {
        Ok(self.repository.ping().await?)
    }

    pub fn config(&self) -> &ShortenerConfig {
        &self.config
    }
}

#[async_trait]
impl<R: Repository, G: Generator> Shortener for ShortenerService<R, G> {
    async fn encode(&self, url: &str) -> Result<Encoded> {
        Self::validate_url(url)?;

        if let Some(record) = self.active_record(url).await? {
            trace!(short_code = %record.short_code, "url already shortened");
            return Ok(Self::existing(record));
        }

        self.store(url).await
    }

    async fn encode_for(&self, user: &Uuid, url: &str) -> Result<Encoded> {
        let encoded = self.encode(url).await?;
        self.repository.link_url_to_user(encoded.id, user).await?;
        Ok(encoded)
    }

    async fn decode(&self, code: &ShortCode) -> Result<Decoded> {
        let record = self
            .repository
            .find_by_short_code(code)
            .await?
            .ok_or_else(|| ShortenerError::NotFound(code.to_string()))?;

        Ok(Decoded {
            deleted: record.is_deleted(),
            original_url: record.original_url,
        })
    }

    async fn encode_batch(
        &self,
        urls: &[String],
        owner: Option<&Uuid>,
    ) -> Result<Vec<(String, ShortCode)>> {
        for url in urls {
            Self::validate_url(url)?;
        }

        let stored = self.store_batch(urls).await?;

        if let Some(owner) = owner {
            for record in &stored {
                self.repository.link_url_to_user(record.id, owner).await?;
            }
        }

        debug!(count = stored.len(), "encoded url batch");
        Ok(urls
            .iter()
            .cloned()
            .zip(stored.into_iter().map(|record| record.short_code))
            .collect())
    }

    async fn urls_of(&self, user: &Uuid) -> Result<Vec<UrlRecord>> {
        Ok(self.repository.find_urls_by_user(user).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use snip_core::NewUser;
    use snip_generator::RandomGenerator;
    use snip_storage::InMemoryRepository;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Hands out a fixed list of codes, then repeats the last one.
    struct ScriptedGenerator {
        codes: Mutex<VecDeque<&'static str>>,
    }

    impl ScriptedGenerator {
        fn new(codes: &[&'static str]) -> Self {
            Self {
                codes: Mutex::new(codes.iter().copied().collect()),
            }
        }
    }

    impl Generator for ScriptedGenerator {
        type Output = ShortCode;

        fn generate(&self) -> ShortCode {
            let mut codes = self.codes.lock().unwrap();
            let code = if codes.len() > 1 {
                codes.pop_front().unwrap()
            } else {
                codes[0]
            };
            ShortCode::new_unchecked(code)
        }
    }

    fn test_service() -> ShortenerService<Arc<InMemoryRepository>, RandomGenerator> {
        ShortenerService::new(
            Arc::new(InMemoryRepository::empty()),
            RandomGenerator::new(),
            ShortenerConfig::default(),
        )
    }

    #[tokio::test]
    async fn encode_then_decode_round_trips() {
        let service = test_service();

        let encoded = service.encode("https://example.com/a").await.unwrap();
        assert!(!encoded.existed);

        let decoded = service.decode(&encoded.short_code).await.unwrap();
        assert_eq!(decoded.original_url, "https://example.com/a");
        assert!(!decoded.deleted);
    }

    #[tokio::test]
    async fn encode_is_idempotent() {
        let service = test_service();

        let first = service.encode("https://example.com").await.unwrap();
        let second = service.encode("https://example.com").await.unwrap();

        assert!(second.existed);
        assert_eq!(first.short_code, second.short_code);
        assert_eq!(first.id, second.id);
        assert_eq!(service.stats().await.unwrap().urls, 1);
    }

    #[tokio::test]
    async fn encode_rejects_invalid_urls() {
        let service = test_service();

        for url in ["", "not-a-valid-url", "ftp://example.com/file", "mailto:a@b.c"] {
            let err = service.encode(url).await.unwrap_err();
            assert!(matches!(err, ShortenerError::InvalidUrl(_)), "{url}: {err:?}");
        }
    }

    #[tokio::test]
    async fn decode_unknown_code_is_not_found() {
        let service = test_service();

        let err = service
            .decode(&ShortCode::new("nonexistent").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, ShortenerError::NotFound(_)));
    }

    #[tokio::test]
    async fn colliding_code_is_retried() {
        let repo = Arc::new(InMemoryRepository::empty());
        repo.insert(NewUrl::new(ShortCode::new_unchecked("taken"), "https://a.example"))
            .await
            .unwrap();
        let service = ShortenerService::new(
            Arc::clone(&repo),
            ScriptedGenerator::new(&["taken", "taken", "free"]),
            ShortenerConfig::default(),
        );

        let encoded = service.encode("https://b.example").await.unwrap();
        assert_eq!(encoded.short_code.as_str(), "free");
    }

    #[tokio::test]
    async fn exhausted_code_attempts_are_reported() {
        let repo = Arc::new(InMemoryRepository::empty());
        repo.insert(NewUrl::new(ShortCode::new_unchecked("taken"), "https://a.example"))
            .await
            .unwrap();
        let service = ShortenerService::new(
            repo,
            ScriptedGenerator::new(&["taken"]),
            ShortenerConfig::builder().max_code_attempts(3).build(),
        );

        let err = service.encode("https://b.example").await.unwrap_err();
        assert!(matches!(err, ShortenerError::CodeSpaceExhausted(3)));
    }

    #[tokio::test]
    async fn deleted_record_decodes_as_deleted_and_url_gets_new_code() {
        let service = test_service();
        let user = Uuid::new_v4();
        service
            .repository
            .create_user(NewUser::anonymous(user))
            .await
            .unwrap();

        let first = service.encode_for(&user, "https://example.com").await.unwrap();
        service
            .repository
            .soft_delete(&user, std::slice::from_ref(&first.short_code))
            .await
            .unwrap();

        let decoded = service.decode(&first.short_code).await.unwrap();
        assert!(decoded.deleted);
        assert_eq!(decoded.original_url, "https://example.com");

        let second = service.encode("https://example.com").await.unwrap();
        assert!(!second.existed);
        assert_ne!(second.short_code, first.short_code);
    }

    #[tokio::test]
    async fn encode_for_links_owner() {
        let service = test_service();
        let user = Uuid::new_v4();
        service
            .repository
            .create_user(NewUser::anonymous(user))
            .await
            .unwrap();

        let encoded = service.encode_for(&user, "https://example.com").await.unwrap();
        // Linking again is a no-op.
        service.encode_for(&user, "https://example.com").await.unwrap();

        let owned = service.urls_of(&user).await.unwrap();
        assert_eq!(owned.len(), 1);
        assert_eq!(owned[0].short_code, encoded.short_code);
    }

    #[tokio::test]
    async fn encode_for_unknown_user_fails() {
        let service = test_service();

        let err = service
            .encode_for(&Uuid::new_v4(), "https://example.com")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ShortenerError::Storage(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn batch_with_duplicates_keeps_url_resolvable() {
        let service = test_service();
        let url = "https://dup.example".to_string();

        let pairs = service
            .encode_batch(&[url.clone(), url.clone(), url.clone()], None)
            .await
            .unwrap();

        assert_eq!(pairs.len(), 3);
        assert!(pairs.iter().all(|(u, _)| *u == url));
        let active = service.repository.find_by_url(&url).await.unwrap().unwrap();
        assert_eq!(active.short_code, pairs[2].1);
        for (_, code) in &pairs {
            assert_eq!(service.decode(code).await.unwrap().original_url, url);
        }
    }

    #[tokio::test]
    async fn batch_links_owner_and_validates_everything_first() {
        let service = test_service();
        let user = Uuid::new_v4();
        service
            .repository
            .create_user(NewUser::anonymous(user))
            .await
            .unwrap();

        let err = service
            .encode_batch(
                &["https://ok.example".to_string(), "nope".to_string()],
                Some(&user),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ShortenerError::InvalidUrl(_)));
        assert_eq!(service.stats().await.unwrap().urls, 0);

        let urls = vec!["https://a.example".to_string(), "https://b.example".to_string()];
        service.encode_batch(&urls, Some(&user)).await.unwrap();
        assert_eq!(service.urls_of(&user).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn batch_redraws_codes_that_are_taken() {
        let repo = Arc::new(InMemoryRepository::empty());
        repo.insert(NewUrl::new(ShortCode::new_unchecked("taken"), "https://a.example"))
            .await
            .unwrap();
        let service = ShortenerService::new(
            Arc::clone(&repo),
            ScriptedGenerator::new(&["taken", "free"]),
            ShortenerConfig::default(),
        );

        let pairs = service
            .encode_batch(&["https://b.example".to_string()], None)
            .await
            .unwrap();

        assert_eq!(pairs[0].1.as_str(), "free");
        let decoded = service.decode(&ShortCode::new_unchecked("taken")).await.unwrap();
        assert_eq!(decoded.original_url, "https://a.example");
        assert!(!decoded.deleted);
    }

    #[tokio::test]
    async fn batch_with_only_taken_codes_is_exhausted() {
        let repo = Arc::new(InMemoryRepository::empty());
        repo.insert(NewUrl::new(ShortCode::new_unchecked("taken"), "https://a.example"))
            .await
            .unwrap();
        let service = ShortenerService::new(
            Arc::clone(&repo),
            ScriptedGenerator::new(&["taken"]),
            ShortenerConfig::builder().max_code_attempts(2).build(),
        );

        let err = service
            .encode_batch(&["https://b.example".to_string()], None)
            .await
            .unwrap_err();

        assert!(matches!(err, ShortenerError::CodeSpaceExhausted(2)));
        let decoded = service.decode(&ShortCode::new_unchecked("taken")).await.unwrap();
        assert_eq!(decoded.original_url, "https://a.example");
        assert_eq!(repo.count_urls().await.unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_encodes_of_one_url_share_a_code() {
        let service = test_service();
        let mut handles = Vec::new();
        for _ in 0..32 {
            let service = service.clone();
            handles.push(tokio::spawn(async move {
                service.encode("https://race.example").await.unwrap()
            }));
        }

        let mut codes = Vec::new();
        for handle in handles {
            codes.push(handle.await.unwrap());
        }

        assert_eq!(codes.iter().filter(|encoded| !encoded.existed).count(), 1);
        assert!(codes.iter().all(|encoded| encoded.short_code == codes[0].short_code));
        assert_eq!(service.stats().await.unwrap().urls, 1);
    }

    #[tokio::test]
    async fn short_url_uses_base_url() {
        let service = ShortenerService::new(
            InMemoryRepository::empty(),
            RandomGenerator::new(),
            ShortenerConfig::builder()
                .base_url("https://sn.ip/")
                .build(),
        );

        let code = ShortCode::new("abc123").unwrap();
        assert_eq!(service.short_url(&code), "https://sn.ip/abc123");
        service.ping().await.unwrap();
    }
}
