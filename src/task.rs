// src/task.rs

use crate::config::{ConfigError, TaskOptions};
use crate::fetcher::FetchError;
use crate::models::{ChunkRange, TaskProgress, TaskState};
use crate::pool::{ChunkReport, DownloaderPool, PoolError, Registration};
use crate::protocol::{self, Plan, ProtocolError};
use crate::store::{ChunkStore, StoreError};
use futures_util::StreamExt;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Suffix of the store that tracks an unfinished download.
pub const STORE_SUFFIX: &str = ".DOWNLOADING";
/// Suffix of the file being assembled before it is moved into place.
pub const PARTIAL_SUFFIX: &str = ".part";

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("invalid task options: {0}")]
    Config(#[from] ConfigError),
    #[error("probe failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("chunk store error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("pool error: {0}")]
    Pool(#[from] PoolError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{url}: chunk {begin}-{end} failed {attempts} times, last error: {error}")]
    RetryExhausted {
        url: String,
        begin: u64,
        end: u64,
        attempts: u32,
        error: String,
    },
    #[error("source size changed from {recorded} to {probed} bytes since the download began")]
    SourceChanged { recorded: u64, probed: u64 },
    #[error("downloader pool closed before the task finished")]
    PoolClosed,
}

/// How a task ended without error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed { path: PathBuf, resumed: bool },
    /// Stopped on request. Pending chunks stay in the store for a later run.
    Cancelled { remaining_chunks: u64 },
}

/// Descriptive state of a task, logged when it starts.
#[derive(Debug, Clone, Serialize)]
pub struct TaskInfo {
    pub url: String,
    pub url_hash: String,
    pub file_size: Option<u64>,
    pub chunk_supported: bool,
    pub file_name: PathBuf,
    pub chunk_size: u64,
    pub chunk_num: u64,
    pub resume: bool,
    pub store_path: Option<PathBuf>,
}

/// One file download, from probing the source to the merged file.
pub struct Task {
    info: TaskInfo,
    url: Arc<str>,
    pool: Arc<DownloaderPool>,
    store: Option<ChunkStore>,
    remaining: u64,
    started: Instant,
    progress: watch::Sender<TaskProgress>,
}

impl Task {
    /// Probes `url` and prepares the download. Opens (or creates) the chunk
    /// store when the server supports byte ranges.
    pub async fn new(
        url: &str,
        options: &TaskOptions,
        pool: Arc<DownloaderPool>,
    ) -> Result<Self, TaskError> {
        options.validate()?;
        let (progress, _) = watch::channel(TaskProgress {
            state: TaskState::Probing,
            total_chunks: 0,
            remaining_chunks: 0,
        });

        let probe = pool.fetcher().probe(url).await?;
        let url_hash = format!("{:x}", Sha256::digest(url.as_bytes()));
        // Zero-sized and unsized resources go through the direct path.
        let chunk_supported = probe.accept_ranges && probe.content_length.is_some_and(|n| n > 0);

        tokio::fs::create_dir_all(&options.download_dir).await?;
        let file_name = choose_file_name(&options.download_dir, url, &url_hash);

        let mut info = TaskInfo {
            url: url.to_owned(),
            url_hash,
            file_size: probe.content_length,
            chunk_supported,
            file_name,
            chunk_size: options.chunk_size,
            chunk_num: 0,
            resume: false,
            store_path: None,
        };

        let store = if chunk_supported {
            let store_path = with_suffix(&info.file_name, STORE_SUFFIX);
            info.resume = ChunkStore::exists(&store_path);
            let store = ChunkStore::open(&store_path).await?;
            info.store_path = Some(store_path);
            Some(store)
        } else {
            None
        };

        Ok(Self {
            info,
            url: Arc::from(url),
            pool,
            store,
            remaining: 0,
            started: Instant::now(),
            progress,
        })
    }

    pub fn info(&self) -> &TaskInfo {
        &self.info
    }

    /// Observes state changes and chunk completions.
    pub fn subscribe(&self) -> watch::Receiver<TaskProgress> {
        self.progress.subscribe()
    }

    /// Runs the task to completion or until `cancel` fires.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<TaskOutcome, TaskError> {
        let result = match self.store.take() {
            Some(store) => self.download_chunked(store, &cancel).await,
            None => self.download_directly(&cancel).await,
        };
        let state = match &result {
            Ok(TaskOutcome::Completed { .. }) => TaskState::Done,
            Ok(TaskOutcome::Cancelled { .. }) => TaskState::Cancelled,
            Err(e) => {
                warn!(url = %self.url, "task failed: {e}");
                TaskState::Failed
            }
        };
        self.set_state(state);
        result
    }

    async fn download_chunked(
        &mut self,
        store: ChunkStore,
        cancel: &CancellationToken,
    ) -> Result<TaskOutcome, TaskError> {
        let result = self.drive(&store, cancel).await;

        let store_path = store.path().to_path_buf();
        if let Err(e) = store.close().await {
            warn!(url = %self.url, "closing chunk store failed: {e}");
        }
        if let Ok(TaskOutcome::Completed { .. }) = &result {
            ChunkStore::destroy(&store_path).await?;
        }
        result
    }

    async fn drive(
        &mut self,
        store: &ChunkStore,
        cancel: &CancellationToken,
    ) -> Result<TaskOutcome, TaskError> {
        self.set_state(TaskState::Planning);
        let (plan, outstanding) = self.plan_chunks(store).await?;
        self.info.chunk_size = plan.chunk_size;
        self.info.chunk_num = plan.chunk_count();
        self.remaining = outstanding.len() as u64;
        self.log_info();

        if outstanding.is_empty() {
            info!(url = %self.url, "no chunks need to download");
            return self.finish(store, &plan).await;
        }

        let mut registration = self.pool.register(&self.url).await?;
        let result = self
            .download_outstanding(&mut registration, store, outstanding, cancel)
            .await;
        // Chunks still queued or in flight are dropped by the pool from here on.
        self.pool.unregister(&registration).await;

        match result? {
            Some(cancelled) => Ok(cancelled),
            None => self.finish(store, &plan).await,
        }
    }

    /// Submits `outstanding` and waits for every report. Returns the
    /// cancelled outcome if `cancel` fires first.
    async fn download_outstanding(
        &mut self,
        registration: &mut Registration,
        store: &ChunkStore,
        outstanding: Vec<ChunkRange>,
        cancel: &CancellationToken,
    ) -> Result<Option<TaskOutcome>, TaskError> {
        for range in outstanding {
            self.pool.submit(registration.chunk(range, store.clone()))?;
        }
        self.set_state(TaskState::Downloading);

        while self.remaining > 0 {
            tokio::select! {
                report = registration.recv() => match report {
                    Some(ChunkReport::Completed(range)) => {
                        self.remaining = self.remaining.saturating_sub(1);
                        let progress = self.publish();
                        info!(
                            "Task({}): downloaded ({}/{}, {:.0}%) elapsed {:?}",
                            self.url,
                            progress.completed_chunks(),
                            progress.total_chunks,
                            progress.fraction() * 100.0,
                            self.started.elapsed()
                        );
                        debug!(range = %range, "chunk reported complete");
                    }
                    Some(ChunkReport::Exhausted { range, attempts, error }) => {
                        return Err(TaskError::RetryExhausted {
                            url: self.url.to_string(),
                            begin: range.begin,
                            end: range.end,
                            attempts,
                            error,
                        });
                    }
                    None => return Err(TaskError::PoolClosed),
                },
                _ = cancel.cancelled() => {
                    info!(
                        "Task({}): downloaded ({}/{}) elapsed {:?}. quit unexpectedly",
                        self.url,
                        self.info.chunk_num - self.remaining,
                        self.info.chunk_num,
                        self.started.elapsed()
                    );
                    return Ok(Some(TaskOutcome::Cancelled { remaining_chunks: self.remaining }));
                }
            }
        }
        Ok(None)
    }

    /// Recovers the outstanding chunks of a committed plan, or makes and
    /// persists a fresh one.
    async fn plan_chunks(
        &mut self,
        store: &ChunkStore,
    ) -> Result<(Plan, Vec<ChunkRange>), TaskError> {
        let file_size = self.info.file_size.unwrap_or(0);

        if self.info.resume {
            match protocol::load_plan(store).await? {
                Some(plan) => {
                    if plan.file_size != file_size {
                        return Err(TaskError::SourceChanged {
                            recorded: plan.file_size,
                            probed: file_size,
                        });
                    }
                    if plan.chunk_size != self.info.chunk_size {
                        info!(
                            recorded = plan.chunk_size,
                            requested = self.info.chunk_size,
                            "resuming with the recorded chunk size"
                        );
                    }
                    let outstanding = protocol::recover_outstanding(store).await?;
                    info!(
                        url = %self.url,
                        outstanding = outstanding.len(),
                        total = plan.chunk_count(),
                        "resuming download"
                    );
                    return Ok((plan, outstanding));
                }
                None => {
                    warn!(url = %self.url, "store has no committed plan, starting over");
                    store.clear().await?;
                    self.info.resume = false;
                }
            }
        }

        let plan = Plan::new(file_size, self.info.chunk_size)?;
        let ranges = protocol::persist_plan(store, &plan).await?;
        Ok((plan, ranges))
    }

    async fn finish(&mut self, store: &ChunkStore, plan: &Plan) -> Result<TaskOutcome, TaskError> {
        self.set_state(TaskState::Merging);
        let partial = with_suffix(&self.info.file_name, PARTIAL_SUFFIX);
        protocol::merge(store, &partial, plan).await?;
        tokio::fs::rename(&partial, &self.info.file_name).await?;
        info!(
            url = %self.url,
            path = %self.info.file_name.display(),
            elapsed = ?self.started.elapsed(),
            "download complete"
        );
        Ok(TaskOutcome::Completed {
            path: self.info.file_name.clone(),
            resumed: self.info.resume,
        })
    }

    /// Single-shot transfer for servers without byte-range support.
    async fn download_directly(&mut self, cancel: &CancellationToken) -> Result<TaskOutcome, TaskError> {
        self.log_info();
        self.set_state(TaskState::Downloading);
        let partial = with_suffix(&self.info.file_name, PARTIAL_SUFFIX);
        let mut body = self.pool.fetcher().fetch_all(&self.url).await?;
        let mut file = tokio::fs::File::create(&partial).await?;

        loop {
            tokio::select! {
                piece = body.next() => match piece {
                    Some(piece) => file.write_all(&piece?).await?,
                    None => break,
                },
                _ = cancel.cancelled() => {
                    drop(file);
                    let _ = tokio::fs::remove_file(&partial).await;
                    return Ok(TaskOutcome::Cancelled { remaining_chunks: 0 });
                }
            }
        }
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&partial, &self.info.file_name).await?;
        info!(url = %self.url, path = %self.info.file_name.display(), "direct download complete");
        Ok(TaskOutcome::Completed {
            path: self.info.file_name.clone(),
            resumed: false,
        })
    }

    fn set_state(&self, state: TaskState) {
        self.progress.send_modify(|progress| {
            progress.state = state;
            progress.total_chunks = self.info.chunk_num;
            progress.remaining_chunks = self.remaining;
        });
    }

    fn publish(&self) -> TaskProgress {
        self.progress.send_modify(|progress| {
            progress.remaining_chunks = self.remaining;
        });
        *self.progress.borrow()
    }

    fn log_info(&self) {
        match serde_json::to_string(&self.info) {
            Ok(json) => info!(task = %json, "task info"),
            Err(e) => debug!("could not serialize task info: {e}"),
        }
    }
}

/// Picks the output path for `url` inside `dir`.
///
/// The name is the last path segment of the URL, or the URL hash when there
/// is none. When a finished file of that name already exists and no download
/// of it is pending, a hash suffix keeps the name stable across runs; a
/// timestamp is the last resort.
fn choose_file_name(dir: &Path, url: &str, url_hash: &str) -> PathBuf {
    let base = url
        .split(|c| c == '?' || c == '#')
        .next()
        .and_then(|path| path.rsplit('/').next())
        .map(str::trim)
        .filter(|name| !name.is_empty() && *name != "." && *name != "..")
        .map(str::to_owned)
        .unwrap_or_else(|| url_hash.to_owned());

    let candidates = [base.clone(), format!("{base}-{}", &url_hash[..8])];
    for name in &candidates {
        let path = dir.join(name);
        if !path.exists() || ChunkStore::exists(&with_suffix(&path, STORE_SUFFIX)) {
            return path;
        }
    }

    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    dir.join(format!("{base}-{secs}"))
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    const HASH: &str = "0123456789abcdef0123456789abcdef";

    #[test]
    fn file_name_from_last_segment() {
        let dir = tempfile::tempdir().unwrap();
        let path = choose_file_name(dir.path(), "https://host/data/file.tsv.gz?x=1", HASH);
        assert_eq!(path, dir.path().join("file.tsv.gz"));
    }

    #[test]
    fn file_name_falls_back_to_hash() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(
            choose_file_name(dir.path(), "https://host/", HASH),
            dir.path().join(HASH)
        );
        assert_eq!(
            choose_file_name(dir.path(), "https://host/..", HASH),
            dir.path().join(HASH)
        );
    }

    #[test]
    fn existing_file_gets_stable_suffix() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.bin"), b"done").unwrap();
        let path = choose_file_name(dir.path(), "http://host/a.bin", HASH);
        assert_eq!(path, dir.path().join("a.bin-01234567"));

        std::fs::write(&path, b"done too").unwrap();
        let path = choose_file_name(dir.path(), "http://host/a.bin", HASH);
        assert!(path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("a.bin-"));
        assert_ne!(path, dir.path().join("a.bin-01234567"));
    }

    #[test]
    fn pending_store_keeps_original_name() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.bin"), b"stale").unwrap();
        std::fs::write(dir.path().join("a.bin.DOWNLOADING"), b"").unwrap();
        assert_eq!(
            choose_file_name(dir.path(), "http://host/a.bin", HASH),
            dir.path().join("a.bin")
        );
    }

    #[test]
    fn suffix_is_appended_to_full_name() {
        assert_eq!(
            with_suffix(Path::new("/d/file.tar.gz"), STORE_SUFFIX),
            PathBuf::from("/d/file.tar.gz.DOWNLOADING")
        );
    }
}
