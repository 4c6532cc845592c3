// src/protocol.rs

//! Chunk bookkeeping on top of [`ChunkStore`].
//!
//! A plan is made durable by writing one pending marker per chunk and then the
//! plan record. From that point the store alone describes what is left to do:
//! a pending marker is deleted only after the chunk's data key was written, so
//! recovering after a crash is a plain key scan.

use crate::keys::{peek_kind, ChunkKey, KeyError, KeyKind};
use crate::models::ChunkRange;
use crate::store::{ChunkStore, StoreError};
use std::path::Path;
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tracing::{debug, info};

/// Value stored under a pending marker. Only the key matters.
pub const PLACEHOLDER: &[u8] = b"-";

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("corrupt key in chunk store: {0}")]
    CorruptKey(#[from] KeyError),
    #[error("corrupt plan record of {0} bytes")]
    CorruptPlan(usize),
    #[error("chunk size must be greater than zero")]
    ZeroChunkSize,
    #[error("file size {0} does not fit the key encoding")]
    FileTooLarge(u64),
    #[error("chunk {0} has no downloaded data")]
    MissingChunk(ChunkRange),
    #[error("chunk {range} holds {actual} bytes, expected {expected}")]
    ChunkLength {
        range: ChunkRange,
        actual: u64,
        expected: u64,
    },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// How a file of `file_size` bytes is cut into chunks of `chunk_size` bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Plan {
    pub file_size: u64,
    pub chunk_size: u64,
}

impl Plan {
    pub fn new(file_size: u64, chunk_size: u64) -> Result<Self, ProtocolError> {
        if chunk_size == 0 {
            return Err(ProtocolError::ZeroChunkSize);
        }
        if file_size > i64::MAX as u64 {
            return Err(ProtocolError::FileTooLarge(file_size));
        }
        Ok(Self {
            file_size,
            chunk_size,
        })
    }

    pub fn chunk_count(&self) -> u64 {
        self.file_size.div_ceil(self.chunk_size)
    }

    /// Range of the chunk at zero-based `index`. The last chunk is clamped to
    /// the end of the file.
    pub fn range(&self, index: u64) -> ChunkRange {
        let begin = index * self.chunk_size;
        let end = begin
            .saturating_add(self.chunk_size - 1)
            .min(self.file_size - 1);
        ChunkRange { begin, end }
    }

    /// Every chunk in file order.
    pub fn ranges(&self) -> impl Iterator<Item = ChunkRange> + '_ {
        (0..self.chunk_count()).map(move |index| self.range(index))
    }

    fn encode(&self) -> Vec<u8> {
        let mut record = Vec::with_capacity(16);
        record.extend_from_slice(&self.file_size.to_be_bytes());
        record.extend_from_slice(&self.chunk_size.to_be_bytes());
        record
    }

    fn decode(record: &[u8]) -> Result<Self, ProtocolError> {
        if record.len() != 16 {
            return Err(ProtocolError::CorruptPlan(record.len()));
        }
        let mut file_size = [0u8; 8];
        let mut chunk_size = [0u8; 8];
        file_size.copy_from_slice(&record[..8]);
        chunk_size.copy_from_slice(&record[8..]);
        Plan::new(u64::from_be_bytes(file_size), u64::from_be_bytes(chunk_size))
            .map_err(|_| ProtocolError::CorruptPlan(record.len()))
    }
}

/// Cuts `[0, file_size - 1]` into consecutive chunks of `chunk_size` bytes.
pub fn plan_fresh(file_size: u64, chunk_size: u64) -> Result<Vec<ChunkRange>, ProtocolError> {
    Ok(Plan::new(file_size, chunk_size)?.ranges().collect())
}

/// Writes a pending marker for every chunk of `plan`, then the plan record.
///
/// Must complete before any chunk of the plan is dispatched.
pub async fn persist_plan(
    store: &ChunkStore,
    plan: &Plan,
) -> Result<Vec<ChunkRange>, ProtocolError> {
    let ranges: Vec<ChunkRange> = plan.ranges().collect();
    let markers = ranges
        .iter()
        .map(|range| (ChunkKey::pending(*range).encode().to_vec(), PLACEHOLDER.to_vec()))
        .collect();
    store.set_many(markers).await?;
    store
        .set(&ChunkKey::count().encode(), plan.encode())
        .await?;
    debug!(
        chunks = ranges.len(),
        file_size = plan.file_size,
        chunk_size = plan.chunk_size,
        "plan persisted"
    );
    Ok(ranges)
}

/// Reads the plan record. `None` means no plan was ever committed.
pub async fn load_plan(store: &ChunkStore) -> Result<Option<Plan>, ProtocolError> {
    match store.get(&ChunkKey::count().encode()).await? {
        Some(record) => Ok(Some(Plan::decode(&record)?)),
        None => Ok(None),
    }
}

/// Every chunk that still has a pending marker, in file order.
///
/// Any key that cannot be decoded is an error: skipping it would leave a hole
/// in the merged file.
pub async fn recover_outstanding(store: &ChunkStore) -> Result<Vec<ChunkRange>, ProtocolError> {
    let mut outstanding = Vec::new();
    store
        .iter_keys(|raw| {
            match peek_kind(raw) {
                Some(KeyKind::Pending) => {
                    let key = ChunkKey::decode(raw)?;
                    outstanding.push(key.range);
                }
                Some(KeyKind::Data) | Some(KeyKind::Count) => {}
                None => {
                    let tag = raw.first().copied().ok_or(KeyError::Length(0))?;
                    return Err(ProtocolError::CorruptKey(KeyError::UnknownTag(tag)));
                }
            }
            Ok(())
        })
        .await?;
    outstanding.sort();
    Ok(outstanding)
}

/// Assembles the file at `output` from the data keys of `plan`.
///
/// Chunks are read by index, so the result does not depend on the order in
/// which they were downloaded. Every chunk must be complete.
pub async fn merge(store: &ChunkStore, output: &Path, plan: &Plan) -> Result<(), ProtocolError> {
    let mut file = File::create(output).await?;
    file.set_len(plan.file_size).await?;

    for range in plan.ranges() {
        let data = store
            .get(&ChunkKey::data(range).encode())
            .await?
            .ok_or(ProtocolError::MissingChunk(range))?;
        if data.len() as u64 != range.len() {
            return Err(ProtocolError::ChunkLength {
                range,
                actual: data.len() as u64,
                expected: range.len(),
            });
        }
        file.seek(SeekFrom::Start(range.begin)).await?;
        file.write_all(&data).await?;
    }

    file.flush().await?;
    file.sync_all().await?;
    info!(
        path = %output.display(),
        bytes = plan.file_size,
        chunks = plan.chunk_count(),
        "chunks merged"
    );
    Ok(())
}
