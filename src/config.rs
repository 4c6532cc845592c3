// src/config.rs

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("max_workers must be at least 1")]
    NoWorkers,
    #[error("chunk_size must be greater than zero")]
    ZeroChunkSize,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config file: {0}")]
    Parse(#[from] serde_json::Error),
}

/// What the pool does when a chunk runs out of retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Report the failure to the owning task only.
    #[default]
    AbortTask,
    /// Report the failure, then stop the pool and release every task.
    HaltPool,
}

/// Settings of a [`DownloaderPool`](crate::pool::DownloaderPool).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Upper bound on concurrently running chunk downloads.
    pub max_workers: usize,
    /// First retry delay; doubles with every further failure of a chunk.
    pub retry_base_delay: Duration,
    pub failure_policy: FailurePolicy,
    pub request_timeout: Duration,
    pub user_agent: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_workers: 8,
            retry_base_delay: Duration::from_millis(200),
            failure_policy: FailurePolicy::AbortTask,
            request_timeout: Duration::from_secs(30),
            user_agent: concat!("chunkfetch/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_workers == 0 {
            return Err(ConfigError::NoWorkers);
        }
        Ok(())
    }
}

/// Per-download settings. There is no default chunk size; callers pick one
/// per source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOptions {
    pub download_dir: PathBuf,
    pub chunk_size: u64,
}

impl TaskOptions {
    pub fn new(download_dir: impl Into<PathBuf>, chunk_size: u64) -> Result<Self, ConfigError> {
        let options = Self {
            download_dir: download_dir.into(),
            chunk_size,
        };
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 {
            return Err(ConfigError::ZeroChunkSize);
        }
        Ok(())
    }
}

/// Everything the binary needs, as stored in a JSON config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetcherConfig {
    #[serde(default)]
    pub pool: PoolConfig,
    pub task: TaskOptions,
}

impl FetcherConfig {
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = tokio::fs::read_to_string(path).await?;
        let config: FetcherConfig = serde_json::from_str(&raw)?;
        config.pool.validate()?;
        config.task.validate()?;
        Ok(config)
    }
}
