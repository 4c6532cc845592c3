#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use chunkfetch::fetcher::{BodyStream, FetchError, Probe, RangeFetcher, RangeResponse};
use chunkfetch::models::ChunkRange;
use futures_util::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Deterministic test content of `len` bytes.
pub fn content(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 251) as u8).collect()
}

/// Serves one in-memory resource with configurable misbehaviour.
pub struct MemoryFetcher {
    content: Vec<u8>,
    accept_ranges: bool,
    over_deliver: usize,
    wrong_content_range: bool,
    piece_size: usize,
    latency: Duration,
    stall_from: Option<u64>,
    fail_always: bool,
    failures: Mutex<HashMap<u64, u32>>,
    pub range_requests: AtomicUsize,
    pub full_requests: AtomicUsize,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    served: Mutex<Vec<ChunkRange>>,
}

impl MemoryFetcher {
    pub fn new(content: Vec<u8>) -> Self {
        Self {
            content,
            accept_ranges: true,
            over_deliver: 0,
            wrong_content_range: false,
            piece_size: 16,
            latency: Duration::ZERO,
            stall_from: None,
            fail_always: false,
            failures: Mutex::new(HashMap::new()),
            range_requests: AtomicUsize::new(0),
            full_requests: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            served: Mutex::new(Vec::new()),
        }
    }

    pub fn without_ranges(mut self) -> Self {
        self.accept_ranges = false;
        self
    }

    pub fn over_delivering(mut self, extra: usize) -> Self {
        self.over_deliver = extra;
        self
    }

    pub fn with_wrong_content_range(mut self) -> Self {
        self.wrong_content_range = true;
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Requests for ranges starting at or after `begin` never answer.
    pub fn stalling_from(mut self, begin: u64) -> Self {
        self.stall_from = Some(begin);
        self
    }

    pub fn failing_always(mut self) -> Self {
        self.fail_always = true;
        self
    }

    /// The range starting at `begin` fails `times` times before succeeding.
    pub fn failing(self, begin: u64, times: u32) -> Self {
        self.failures.lock().unwrap().insert(begin, times);
        self
    }

    pub fn served(&self) -> Vec<ChunkRange> {
        let mut served = self.served.lock().unwrap().clone();
        served.sort();
        served
    }

    fn body(&self, bytes: Vec<u8>) -> BodyStream {
        let pieces: Vec<Result<Bytes, FetchError>> = bytes
            .chunks(self.piece_size.max(1))
            .map(|piece| Ok(Bytes::copy_from_slice(piece)))
            .collect();
        stream::iter(pieces).boxed()
    }

    fn injected_failure(&self, begin: u64) -> bool {
        if self.fail_always {
            return true;
        }
        let mut failures = self.failures.lock().unwrap();
        match failures.get_mut(&begin) {
            Some(left) if *left > 0 => {
                *left -= 1;
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl RangeFetcher for MemoryFetcher {
    async fn probe(&self, _url: &str) -> Result<Probe, FetchError> {
        Ok(Probe {
            content_length: Some(self.content.len() as u64),
            accept_ranges: self.accept_ranges,
        })
    }

    async fn fetch_range(&self, _url: &str, range: ChunkRange) -> Result<RangeResponse, FetchError> {
        self.range_requests.fetch_add(1, Ordering::SeqCst);
        if self.stall_from.is_some_and(|from| range.begin >= from) {
            std::future::pending::<()>().await;
        }

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.injected_failure(range.begin) {
            return Err(FetchError::Other(format!("injected failure for {range}")));
        }

        let total = self.content.len();
        if !self.accept_ranges {
            return Ok(RangeResponse {
                status: 200,
                content_range: None,
                body: self.body(self.content.clone()),
            });
        }

        let end = (range.end as usize).min(total - 1);
        let mut bytes = self.content[range.begin as usize..=end].to_vec();
        bytes.extend(std::iter::repeat(0xEE).take(self.over_deliver));
        let content_range = if self.wrong_content_range {
            format!("bytes {}-{}/{}", range.begin + 1, range.end + 1, total)
        } else {
            format!("bytes {}-{}/{}", range.begin, range.end, total)
        };
        self.served.lock().unwrap().push(range);
        Ok(RangeResponse {
            status: 206,
            content_range: Some(content_range),
            body: self.body(bytes),
        })
    }

    async fn fetch_all(&self, _url: &str) -> Result<BodyStream, FetchError> {
        self.full_requests.fetch_add(1, Ordering::SeqCst);
        Ok(self.body(self.content.clone()))
    }
}

pub fn shared(fetcher: MemoryFetcher) -> Arc<MemoryFetcher> {
    Arc::new(fetcher)
}
