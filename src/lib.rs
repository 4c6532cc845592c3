pub mod config;
pub mod downloader;
pub mod fetcher;
pub mod keys;
pub mod models;
pub mod pool;
pub mod protocol;
pub mod store;
pub mod task;

/// Convenient type alias exposing common structs.
pub mod prelude {
    pub use crate::config::{FailurePolicy, FetcherConfig, PoolConfig, TaskOptions};
    pub use crate::fetcher::{RangeFetcher, ReqwestFetcher};
    pub use crate::models::{ChunkRange, TaskProgress, TaskState};
    pub use crate::pool::DownloaderPool;
    pub use crate::task::{Task, TaskError, TaskOutcome};
}
