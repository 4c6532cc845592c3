use crate::fetcher::{BodyStream, FetchError, RangeFetcher};
use crate::models::{Chunk, ChunkRange};
use crate::store::StoreError;
use futures_util::StreamExt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, warn};

/// A chunk may fail this many times and still be retried. One more failure
/// makes it unrecoverable.
pub const MAX_CHUNK_RETRIES: u32 = 10;

/// Custom errors for chunk downloads.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("unexpected status {0}")]
    UnexpectedStatus(u16),
    #[error("requested {expected}, server answered with Content-Range {received:?}")]
    RangeMismatch {
        expected: ChunkRange,
        received: Option<String>,
    },
    #[error("body ended after {received} of {expected} bytes")]
    ShortBody { received: u64, expected: u64 },
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("gave up after {attempts} failed attempts, last error: {last}")]
    RetryExhausted {
        attempts: u32,
        last: Box<DownloadError>,
    },
}

impl DownloadError {
    /// Whether the chunk should be submitted again.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, DownloadError::RetryExhausted { .. })
    }
}

/// Downloads one chunk at a time. Owned and recycled by the pool.
pub struct ChunkDownloader {
    id: usize,
    fetcher: Arc<dyn RangeFetcher>,
}

impl ChunkDownloader {
    pub fn new(id: usize, fetcher: Arc<dyn RangeFetcher>) -> Self {
        Self { id, fetcher }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Fetches the chunk's range, stores the bytes under its data key and
    /// then removes its pending marker.
    ///
    /// Every failure is counted on the chunk. Up to [`MAX_CHUNK_RETRIES`]
    /// failures come back as recoverable errors; after that the error is
    /// [`DownloadError::RetryExhausted`].
    pub async fn download(&self, chunk: &mut Chunk) -> Result<(), DownloadError> {
        let err = match self.download_once(chunk).await {
            Ok(()) => {
                debug!(worker = self.id, url = %chunk.url, range = %chunk.range, "chunk stored");
                return Ok(());
            }
            Err(err) => err,
        };

        let failures = chunk.record_failure();
        if failures > MAX_CHUNK_RETRIES {
            error!(
                worker = self.id,
                url = %chunk.url,
                range = %chunk.range,
                attempts = failures,
                "chunk failed too many times: {err}"
            );
            return Err(DownloadError::RetryExhausted {
                attempts: failures,
                last: Box::new(err),
            });
        }
        warn!(
            worker = self.id,
            url = %chunk.url,
            range = %chunk.range,
            attempt = failures,
            "chunk download failed: {err}"
        );
        Err(err)
    }

    async fn download_once(&self, chunk: &Chunk) -> Result<(), DownloadError> {
        let range = chunk.range;
        let resp = self.fetcher.fetch_range(&chunk.url, range).await?;

        match resp.status {
            206 => {}
            // Only acceptable when the whole body starts where the chunk does.
            200 if range.begin == 0 => {}
            200 => {
                return Err(DownloadError::RangeMismatch {
                    expected: range,
                    received: resp.content_range,
                })
            }
            status => return Err(DownloadError::UnexpectedStatus(status)),
        }

        if let Some(header) = resp.content_range.as_deref() {
            if parse_content_range(header) != Some((range.begin, range.end)) {
                return Err(DownloadError::RangeMismatch {
                    expected: range,
                    received: Some(header.to_owned()),
                });
            }
        }

        let data = read_range(resp.body, range.len()).await?;

        // The marker goes only once the data is safely stored.
        chunk.store.set(&chunk.data_key().encode(), data).await?;
        chunk.store.delete(&chunk.pending_key().encode()).await?;
        Ok(())
    }
}

/// Reads exactly `needed` bytes. Anything the server sends past that is
/// dropped and the body is treated as finished.
async fn read_range(mut body: BodyStream, needed: u64) -> Result<Vec<u8>, DownloadError> {
    let needed = needed as usize;
    let mut data = Vec::with_capacity(needed);
    while let Some(piece) = body.next().await {
        let piece = piece?;
        let room = needed - data.len();
        if piece.len() >= room {
            if piece.len() > room {
                debug!(extra = piece.len() - room, "discarding bytes past the requested range");
            }
            data.extend_from_slice(&piece[..room]);
            return Ok(data);
        }
        data.extend_from_slice(&piece);
    }
    if data.len() < needed {
        return Err(DownloadError::ShortBody {
            received: data.len() as u64,
            expected: needed as u64,
        });
    }
    Ok(data)
}

/// Parses `bytes <begin>-<end>/<total>` into `(begin, end)`.
pub fn parse_content_range(header: &str) -> Option<(u64, u64)> {
    let (unit, rest) = header.trim().split_once(' ')?;
    if !unit.eq_ignore_ascii_case("bytes") {
        return None;
    }
    let (span, _total) = rest.trim().split_once('/')?;
    let (begin, end) = span.split_once('-')?;
    Some((begin.trim().parse().ok()?, end.trim().parse().ok()?))
}
