// src/pool.rs

use crate::config::{ConfigError, FailurePolicy, PoolConfig};
use crate::downloader::{ChunkDownloader, DownloadError};
use crate::fetcher::RangeFetcher;
use crate::models::{Chunk, ChunkRange, WorkerStatus};
use crate::store::ChunkStore;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("invalid pool config: {0}")]
    Config(#[from] ConfigError),
    #[error("downloader pool is shut down")]
    ShutDown,
    #[error("downloader pool is already running")]
    AlreadyStarted,
    #[error("a task for {0} is already registered")]
    AlreadyRegistered(String),
}

/// Sent to the task owning a chunk once the pool is done with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkReport {
    Completed(ChunkRange),
    /// The chunk failed more often than the retry ceiling allows.
    Exhausted {
        range: ChunkRange,
        attempts: u32,
        error: String,
    },
}

/// A task's claim on one URL. Chunks built from it are downloaded only while
/// this registration is the current one for the URL, so leftovers of an
/// earlier task on the same URL are dropped.
#[derive(Debug)]
pub struct Registration {
    id: u64,
    url: Arc<str>,
    reports: UnboundedReceiver<ChunkReport>,
}

impl Registration {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Builds a chunk of this registration, ready for [`DownloaderPool::submit`].
    pub fn chunk(&self, range: ChunkRange, store: ChunkStore) -> Chunk {
        Chunk::new(range, self.url.clone(), store).registered_as(self.id)
    }

    /// Next report, or `None` once the pool dropped the registration.
    pub async fn recv(&mut self) -> Option<ChunkReport> {
        self.reports.recv().await
    }
}

struct Notifier {
    registration: u64,
    tx: UnboundedSender<ChunkReport>,
}

/// Orders workers for reuse: idle before busy, then lowest id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Rank {
    status: WorkerStatus,
    id: usize,
}

/// Busy and idle workers plus their ranking. Always changed together, so
/// they sit behind one lock.
#[derive(Default)]
struct Workers {
    busy: HashMap<usize, Arc<ChunkDownloader>>,
    idle: HashMap<usize, Arc<ChunkDownloader>>,
    ranks: BTreeSet<Rank>,
    next_id: usize,
}

impl Workers {
    /// Reuses the best idle worker, or creates one. The caller holds an
    /// admission permit, so at most `max` workers are ever busy.
    fn acquire(&mut self, max: usize, fetcher: &Arc<dyn RangeFetcher>) -> Arc<ChunkDownloader> {
        debug_assert!(self.busy.len() < max, "admission let in more than {max} chunks");

        let best_idle = self
            .ranks
            .first()
            .copied()
            .filter(|rank| rank.status == WorkerStatus::Idle)
            .and_then(|rank| {
                self.ranks.remove(&rank);
                self.idle.remove(&rank.id)
            });

        let worker = best_idle.unwrap_or_else(|| {
            let id = self.next_id;
            self.next_id += 1;
            debug!(worker = id, "starting chunk downloader");
            Arc::new(ChunkDownloader::new(id, fetcher.clone()))
        });

        self.ranks.insert(Rank {
            status: WorkerStatus::Busy,
            id: worker.id(),
        });
        self.busy.insert(worker.id(), worker.clone());
        worker
    }

    fn release(&mut self, id: usize) {
        if let Some(worker) = self.busy.remove(&id) {
            self.ranks.remove(&Rank {
                status: WorkerStatus::Busy,
                id,
            });
            self.ranks.insert(Rank {
                status: WorkerStatus::Idle,
                id,
            });
            self.idle.insert(id, worker);
        }
    }
}

#[derive(Default)]
struct Notifiers {
    by_url: HashMap<Arc<str>, Notifier>,
    next_registration: u64,
}

/// Schedules chunks of any number of tasks onto a bounded set of
/// [`ChunkDownloader`]s.
///
/// Tasks register their URL, submit chunks built from the [`Registration`],
/// and receive one [`ChunkReport`] per chunk that completes or runs out of
/// retries. Chunks that fail recoverably are resubmitted by the pool itself.
pub struct DownloaderPool {
    config: PoolConfig,
    fetcher: Arc<dyn RangeFetcher>,
    workers: Mutex<Workers>,
    notifiers: Mutex<Notifiers>,
    admission: Arc<Semaphore>,
    queue_tx: UnboundedSender<Chunk>,
    queue_rx: Mutex<Option<UnboundedReceiver<Chunk>>>,
    shutdown: CancellationToken,
}

impl DownloaderPool {
    pub fn new(config: PoolConfig, fetcher: Arc<dyn RangeFetcher>) -> Result<Arc<Self>, PoolError> {
        config.validate()?;
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        Ok(Arc::new(Self {
            admission: Arc::new(Semaphore::new(config.max_workers)),
            config,
            fetcher,
            workers: Mutex::new(Workers::default()),
            notifiers: Mutex::new(Notifiers::default()),
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            shutdown: CancellationToken::new(),
        }))
    }

    pub fn fetcher(&self) -> Arc<dyn RangeFetcher> {
        self.fetcher.clone()
    }

    /// Spawns the dispatcher loop. Can be called once.
    pub async fn start(self: &Arc<Self>) -> Result<JoinHandle<()>, PoolError> {
        if self.is_shut_down() {
            return Err(PoolError::ShutDown);
        }
        let queue = self
            .queue_rx
            .lock()
            .await
            .take()
            .ok_or(PoolError::AlreadyStarted)?;
        let pool = self.clone();
        info!(max_workers = self.config.max_workers, "downloader pool started");
        Ok(tokio::spawn(async move { pool.dispatch(queue).await }))
    }

    /// Stops the dispatcher and drops every registration, so waiting tasks
    /// see their channel close.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.notifiers.lock().await.by_url.clear();
        info!("downloader pool stopped");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Claims `url` for one task. Fails while another registration for the
    /// same URL is live.
    pub async fn register(&self, url: &str) -> Result<Registration, PoolError> {
        if self.is_shut_down() {
            return Err(PoolError::ShutDown);
        }
        let mut notifiers = self.notifiers.lock().await;
        if notifiers.by_url.contains_key(url) {
            return Err(PoolError::AlreadyRegistered(url.to_owned()));
        }
        notifiers.next_registration += 1;
        let registration = notifiers.next_registration;
        let (tx, reports) = mpsc::unbounded_channel();
        let url: Arc<str> = Arc::from(url);
        notifiers
            .by_url
            .insert(url.clone(), Notifier { registration, tx });
        Ok(Registration {
            id: registration,
            url,
            reports,
        })
    }

    /// Ends a registration. Its queued chunks are dropped instead of
    /// downloaded. A newer registration of the same URL is left alone.
    pub async fn unregister(&self, registration: &Registration) {
        let mut notifiers = self.notifiers.lock().await;
        let current = notifiers
            .by_url
            .get(registration.url())
            .is_some_and(|n| n.registration == registration.id);
        if current {
            notifiers.by_url.remove(registration.url());
        }
    }

    /// Queues a chunk for download.
    pub fn submit(&self, chunk: Chunk) -> Result<(), PoolError> {
        if self.is_shut_down() {
            return Err(PoolError::ShutDown);
        }
        self.queue_tx.send(chunk).map_err(|_| PoolError::ShutDown)
    }

    /// `(busy, idle)` worker counts.
    pub async fn worker_counts(&self) -> (usize, usize) {
        let workers = self.workers.lock().await;
        (workers.busy.len(), workers.idle.len())
    }

    /// Whether the registration `chunk` was submitted under is still live.
    async fn is_current(&self, chunk: &Chunk) -> bool {
        self.notifiers
            .lock()
            .await
            .by_url
            .get(&chunk.url)
            .is_some_and(|n| n.registration == chunk.registration())
    }

    async fn dispatch(self: Arc<Self>, mut queue: UnboundedReceiver<Chunk>) {
        loop {
            let chunk = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                chunk = queue.recv() => match chunk {
                    Some(chunk) => chunk,
                    None => break,
                },
            };

            // Waits here while every worker is busy.
            let permit = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                permit = self.admission.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            // Checked after admission: the owning task may have gone away
            // while the chunk waited for a permit.
            if !self.is_current(&chunk).await {
                debug!(url = %chunk.url, range = %chunk.range, "dropping chunk of unregistered task");
                continue;
            }

            let worker = self
                .workers
                .lock()
                .await
                .acquire(self.config.max_workers, &self.fetcher);
            let pool = self.clone();
            tokio::spawn(async move { pool.run_chunk(worker, chunk, permit).await });
        }
        debug!("dispatcher loop exited");
    }

    async fn run_chunk(
        self: Arc<Self>,
        worker: Arc<ChunkDownloader>,
        mut chunk: Chunk,
        permit: OwnedSemaphorePermit,
    ) {
        let result = worker.download(&mut chunk).await;
        self.workers.lock().await.release(worker.id());
        drop(permit);

        match result {
            Ok(()) => {
                debug!(worker = worker.id(), url = %chunk.url, range = %chunk.range, "chunk done");
                self.notify(&chunk, ChunkReport::Completed(chunk.range)).await;
            }
            Err(DownloadError::RetryExhausted { attempts, last }) => {
                if !self.is_current(&chunk).await {
                    debug!(url = %chunk.url, range = %chunk.range, "exhausted chunk of unregistered task");
                    return;
                }
                self.notify(
                    &chunk,
                    ChunkReport::Exhausted {
                        range: chunk.range,
                        attempts,
                        error: last.to_string(),
                    },
                )
                .await;
                if self.config.failure_policy == FailurePolicy::HaltPool {
                    error!(url = %chunk.url, range = %chunk.range, "halting downloader pool");
                    self.shutdown().await;
                }
            }
            Err(_) => self.retry(chunk).await,
        }
    }

    async fn retry(&self, chunk: Chunk) {
        let delay = retry_delay(chunk.failures(), self.config.retry_base_delay);
        if !delay.is_zero() {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        if !self.is_current(&chunk).await {
            debug!(url = %chunk.url, range = %chunk.range, "not retrying chunk of unregistered task");
            return;
        }
        if let Err(e) = self.submit(chunk) {
            warn!("could not resubmit chunk: {e}");
        }
    }

    async fn notify(&self, chunk: &Chunk, report: ChunkReport) {
        let notifiers = self.notifiers.lock().await;
        match notifiers.by_url.get(&chunk.url) {
            Some(n) if n.registration == chunk.registration() => {
                // The task may have stopped listening; that is fine.
                let _ = n.tx.send(report);
            }
            _ => debug!(url = %chunk.url, range = %chunk.range, "no current task for report"),
        }
    }
}

/// `base * 2^(failures - 1)`, capped.
pub fn retry_delay(failures: u32, base: Duration) -> Duration {
    let exponent = failures.saturating_sub(1);
    base.saturating_mul(2_u32.saturating_pow(exponent))
        .min(MAX_RETRY_DELAY)
}
