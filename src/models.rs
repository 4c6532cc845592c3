// src/models.rs

use crate::keys::{ChunkKey, KeyKind};
use crate::store::ChunkStore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// An inclusive byte range `[begin, end]` of the remote resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChunkRange {
    pub begin: u64,
    pub end: u64,
}

impl ChunkRange {
    pub const ZERO: ChunkRange = ChunkRange { begin: 0, end: 0 };

    /// Returns `None` when `end < begin` or an endpoint does not fit the
    /// signed key encoding.
    pub fn new(begin: u64, end: u64) -> Option<Self> {
        if end < begin || end > i64::MAX as u64 {
            return None;
        }
        Some(Self { begin, end })
    }

    /// Number of bytes covered, `end - begin + 1`.
    pub fn len(&self) -> u64 {
        self.end - self.begin + 1
    }

    pub(crate) fn begin_i64(&self) -> i64 {
        self.begin as i64
    }

    pub(crate) fn end_i64(&self) -> i64 {
        self.end as i64
    }

    /// The value of a `Range` request header for this chunk.
    pub fn range_header(&self) -> String {
        format!("bytes={}-{}", self.begin, self.end)
    }
}

impl fmt::Display for ChunkRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.begin, self.end)
    }
}

/// One unit of work handed to the pool.
///
/// The store handle is a clone of the one owned by the task; the chunk only
/// borrows the task's persistence for the duration of one download.
#[derive(Clone)]
pub struct Chunk {
    pub range: ChunkRange,
    pub url: Arc<str>,
    pub store: ChunkStore,
    registration: u64,
    failures: u32,
}

impl Chunk {
    /// A chunk not tied to any pool registration. The pool only downloads
    /// chunks built through [`Registration::chunk`](crate::pool::Registration::chunk).
    pub fn new(range: ChunkRange, url: Arc<str>, store: ChunkStore) -> Self {
        Self {
            range,
            url,
            store,
            registration: 0,
            failures: 0,
        }
    }

    pub(crate) fn registered_as(mut self, registration: u64) -> Self {
        self.registration = registration;
        self
    }

    /// Id of the pool registration this chunk was submitted under.
    pub fn registration(&self) -> u64 {
        self.registration
    }

    /// Marker whose presence means "not downloaded yet".
    pub fn pending_key(&self) -> ChunkKey {
        ChunkKey::pending(self.range)
    }

    pub fn data_key(&self) -> ChunkKey {
        self.pending_key().with_kind(KeyKind::Data)
    }

    /// How many download attempts have failed so far.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub(crate) fn record_failure(&mut self) -> u32 {
        self.failures += 1;
        self.failures
    }
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chunk")
            .field("range", &self.range)
            .field("url", &self.url)
            .field("registration", &self.registration)
            .field("failures", &self.failures)
            .finish()
    }
}

/// Worker state inside the pool. Idle sorts before busy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum WorkerStatus {
    Idle,
    Busy,
}

/// Lifecycle of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    Probing,
    Planning,
    Downloading,
    Merging,
    Done,
    Cancelled,
    Failed,
}

impl TaskState {
    /// No further transition follows.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Done | TaskState::Cancelled | TaskState::Failed)
    }
}

/// Snapshot published to task observers on every transition and completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskProgress {
    pub state: TaskState,
    pub total_chunks: u64,
    pub remaining_chunks: u64,
}

impl TaskProgress {
    pub fn completed_chunks(&self) -> u64 {
        self.total_chunks.saturating_sub(self.remaining_chunks)
    }

    /// Calculates progress as a fraction from 0.0 to 1.0.
    pub fn fraction(&self) -> f32 {
        if self.total_chunks == 0 {
            0.0
        } else {
            self.completed_chunks() as f32 / self.total_chunks as f32
        }
    }
}
