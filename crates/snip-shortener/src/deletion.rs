//! Background soft deletion.
//!
//! A fixed set of workers drains one bounded queue of [`DeletionJob`]s and
//! applies them with [`Repository::soft_delete`]. Deletion is best effort:
//! a failed job is logged and dropped, never retried.

use crate::error::PoolError;
use parking_lot::Mutex;
use snip_core::{Repository, ShortCode};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use typed_builder::TypedBuilder;
use uuid::Uuid;

pub const DEFAULT_WORKERS: usize = 50;
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

#[derive(Debug, Clone, TypedBuilder)]
pub struct DeletionPoolConfig {
    #[builder(default = DEFAULT_WORKERS)]
    pub workers: usize,
    /// Jobs that may wait in the queue before `request_deletion` blocks.
    #[builder(default = DEFAULT_QUEUE_CAPACITY)]
    pub queue_capacity: usize,
}

impl Default for DeletionPoolConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// One code to delete on behalf of its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletionJob {
    pub user: Uuid,
    pub short_code: ShortCode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    Idle,
    Running,
    Draining,
    Stopped,
}

type SharedReceiver = Arc<AsyncMutex<mpsc::Receiver<DeletionJob>>>;

/// A persistent pool of deletion workers sharing one bounded queue.
pub struct DeletionPool<R> {
    repository: Arc<R>,
    config: DeletionPoolConfig,
    state: Mutex<PoolState>,
    sender: mpsc::Sender<DeletionJob>,
    receiver: SharedReceiver,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl<R: Repository> DeletionPool<R> {
    /// Creates an idle pool. Nothing runs until [`DeletionPool::start`].
    pub fn new(repository: R, config: DeletionPoolConfig) -> Self {
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        Self {
            repository: Arc::new(repository),
            config,
            state: Mutex::new(PoolState::Idle),
            sender,
            receiver: Arc::new(AsyncMutex::new(receiver)),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    pub fn state(&self) -> PoolState {
        *self.state.lock()
    }

    /// Spawns the workers. A pool starts at most once.
    pub fn start(&self) -> Result<(), PoolError> {
        let mut state = self.state.lock();
        if *state != PoolState::Idle {
            return Err(PoolError::AlreadyStarted);
        }

        let workers = self.config.workers.max(1);
        for worker in 0..workers {
            self.tracker.spawn(run_worker(
                worker,
                Arc::clone(&self.repository),
                Arc::clone(&self.receiver),
                self.shutdown.clone(),
            ));
        }

        *state = PoolState::Running;
        info!(
            workers,
            queue_capacity = self.config.queue_capacity,
            "deletion pool started"
        );
        Ok(())
    }

    /// Queues one job per code.
    ///
    /// Waits only while the queue is full. Fails with
    /// [`PoolError::NotRunning`] if the pool is not running or starts
    /// shutting down while this call waits; jobs queued before that stay
    /// queued.
    pub async fn request_deletion(
        &self,
        user: Uuid,
        codes: Vec<ShortCode>,
    ) -> Result<(), PoolError> {
        if self.state() != PoolState::Running {
            return Err(PoolError::NotRunning);
        }

        let count = codes.len();
        for short_code in codes {
            let job = DeletionJob { user, short_code };
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return Err(PoolError::NotRunning),
                sent = self.sender.send(job) => sent.map_err(|_| PoolError::NotRunning)?,
            }
        }

        debug!(%user, count, "queued deletion jobs");
        Ok(())
    }

    /// Jobs waiting in the queue.
    pub fn queued(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }

    /// Stops the pool.
    ///
    /// Workers finish the job they already took and exit. Jobs still queued
    /// are discarded.
    pub async fn shutdown(&self) {
        {
            let mut state = self.state.lock();
            match *state {
                PoolState::Running => *state = PoolState::Draining,
                PoolState::Idle => {
                    *state = PoolState::Stopped;
                    return;
                }
                PoolState::Draining | PoolState::Stopped => return,
            }
        }

        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;

        let mut receiver = self.receiver.lock().await;
        receiver.close();
        let mut discarded = 0usize;
        while receiver.try_recv().is_ok() {
            discarded += 1;
        }

        *self.state.lock() = PoolState::Stopped;
        info!(discarded, "deletion pool stopped");
    }
}

async fn run_worker<R: Repository>(
    worker: usize,
    repository: Arc<R>,
    receiver: SharedReceiver,
    shutdown: CancellationToken,
) {
    loop {
        let job = tokio::select! {
            biased;
            _ = shutdown.cancelled() => None,
            job = async { receiver.lock().await.recv().await } => job,
        };
        let Some(job) = job else {
            break;
        };

        match repository
            .soft_delete(&job.user, std::slice::from_ref(&job.short_code))
            .await
        {
            Ok(marked) => debug!(
                worker,
                user = %job.user,
                short_code = %job.short_code,
                marked,
                "applied deletion"
            ),
            Err(e) => warn!(
                worker,
                user = %job.user,
                short_code = %job.short_code,
                error = %e,
                "deletion failed, dropping job"
            ),
        }
    }
    debug!(worker, "deletion worker exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use snip_core::{NewUrl, NewUser};
    use snip_storage::InMemoryRepository;
    use std::time::{Duration, Instant};

    async fn owned_codes(repo: &InMemoryRepository, user: Uuid, count: usize) -> Vec<ShortCode> {
        repo.create_user(NewUser::anonymous(user)).await.unwrap();
        let mut codes = Vec::with_capacity(count);
        for i in 0..count {
            let code = ShortCode::new_unchecked(format!("code{i:04}"));
            let record = repo
                .insert(NewUrl::new(code.clone(), format!("https://example.com/{i}")))
                .await
                .unwrap();
            repo.link_url_to_user(record.id, &user).await.unwrap();
            codes.push(code);
        }
        codes
    }

    fn small_config() -> DeletionPoolConfig {
        DeletionPoolConfig::builder().workers(4).queue_capacity(16).build()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn requested_deletions_all_complete() {
        let repo = Arc::new(InMemoryRepository::empty());
        let user = Uuid::new_v4();
        let codes = owned_codes(&repo, user, 100).await;
        let pool = DeletionPool::new(Arc::clone(&repo), DeletionPoolConfig::default());
        pool.start().unwrap();

        let started = Instant::now();
        pool.request_deletion(user, codes.clone()).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));

        awaitility::at_most(Duration::from_secs(5))
            .poll_interval(Duration::from_millis(20))
            .until_async(|| async {
                let mut all_deleted = true;
                for code in &codes {
                    let record = repo.find_by_short_code(code).await.unwrap().unwrap();
                    all_deleted &= record.is_deleted();
                }
                all_deleted
            })
            .await;

        pool.shutdown().await;
        assert_eq!(pool.state(), PoolState::Stopped);
        assert_eq!(repo.count_urls().await.unwrap(), 100);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn foreign_codes_are_skipped() {
        let repo = Arc::new(InMemoryRepository::empty());
        let owner = Uuid::new_v4();
        let stranger = Uuid::new_v4();
        let codes = owned_codes(&repo, owner, 3).await;
        repo.create_user(NewUser::anonymous(stranger)).await.unwrap();
        let pool = DeletionPool::new(Arc::clone(&repo), small_config());
        pool.start().unwrap();

        pool.request_deletion(stranger, codes.clone()).await.unwrap();
        pool.request_deletion(owner, vec![codes[0].clone()]).await.unwrap();

        awaitility::at_most(Duration::from_secs(5))
            .poll_interval(Duration::from_millis(20))
            .until_async(|| async {
                repo.find_by_short_code(&codes[0])
                    .await
                    .unwrap()
                    .is_some_and(|r| r.is_deleted())
            })
            .await;
        pool.shutdown().await;

        for code in &codes[1..] {
            assert!(!repo.find_by_short_code(code).await.unwrap().unwrap().is_deleted());
        }
    }

    #[tokio::test]
    async fn requests_before_start_fail_fast() {
        let pool = DeletionPool::new(InMemoryRepository::empty(), small_config());

        let err = pool
            .request_deletion(Uuid::new_v4(), vec![ShortCode::new_unchecked("abc")])
            .await
            .unwrap_err();
        assert_eq!(err, PoolError::NotRunning);
        assert_eq!(pool.state(), PoolState::Idle);
    }

    #[tokio::test]
    async fn requests_after_shutdown_fail_fast() {
        let pool = DeletionPool::new(InMemoryRepository::empty(), small_config());
        pool.start().unwrap();
        pool.shutdown().await;

        let err = pool
            .request_deletion(Uuid::new_v4(), vec![ShortCode::new_unchecked("abc")])
            .await
            .unwrap_err();
        assert_eq!(err, PoolError::NotRunning);
    }

    #[tokio::test]
    async fn pool_starts_once() {
        let pool = DeletionPool::new(InMemoryRepository::empty(), small_config());

        pool.start().unwrap();
        assert_eq!(pool.start().unwrap_err(), PoolError::AlreadyStarted);

        pool.shutdown().await;
        assert_eq!(pool.start().unwrap_err(), PoolError::AlreadyStarted);
    }

    #[tokio::test]
    async fn shutdown_of_idle_pool_stops_it() {
        let pool = DeletionPool::new(InMemoryRepository::empty(), small_config());

        pool.shutdown().await;

        assert_eq!(pool.state(), PoolState::Stopped);
        assert_eq!(pool.queued(), 0);
    }
}
