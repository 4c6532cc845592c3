// src/fetcher.rs

use crate::config::PoolConfig;
use crate::models::ChunkRange;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{BoxStream, StreamExt};
use reqwest::header::{ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, RANGE};
use reqwest::Client;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("server answered with status {0}")]
    Status(u16),
    #[error("{0}")]
    Other(String),
}

/// A response body delivered piece by piece.
pub type BodyStream = BoxStream<'static, Result<Bytes, FetchError>>;

/// What a header-only request tells about a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Probe {
    pub content_length: Option<u64>,
    pub accept_ranges: bool,
}

/// Answer to a ranged GET.
pub struct RangeResponse {
    pub status: u16,
    /// Raw `Content-Range` header, if the server sent one.
    pub content_range: Option<String>,
    pub body: BodyStream,
}

/// The HTTP operations the downloader needs.
#[async_trait]
pub trait RangeFetcher: Send + Sync {
    /// Issues a HEAD request.
    async fn probe(&self, url: &str) -> Result<Probe, FetchError>;

    /// Issues a GET with `Range: bytes=<begin>-<end>`.
    async fn fetch_range(&self, url: &str, range: ChunkRange) -> Result<RangeResponse, FetchError>;

    /// Issues a plain GET and returns the whole body.
    async fn fetch_all(&self, url: &str) -> Result<BodyStream, FetchError>;
}

/// [`RangeFetcher`] backed by a shared `reqwest` client.
#[derive(Debug, Clone)]
pub struct ReqwestFetcher {
    client: Client,
}

impl ReqwestFetcher {
    pub fn new(config: &PoolConfig) -> Result<Self, FetchError> {
        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl RangeFetcher for ReqwestFetcher {
    async fn probe(&self, url: &str) -> Result<Probe, FetchError> {
        let resp = self.client.head(url).send().await?.error_for_status()?;
        let content_length = resp
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok());
        let accept_ranges = resp
            .headers()
            .get(ACCEPT_RANGES)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.trim().eq_ignore_ascii_case("bytes"))
            .unwrap_or(false);
        Ok(Probe {
            content_length,
            accept_ranges,
        })
    }

    async fn fetch_range(&self, url: &str, range: ChunkRange) -> Result<RangeResponse, FetchError> {
        let resp = self
            .client
            .get(url)
            .header(RANGE, range.range_header())
            .send()
            .await?;
        let content_range = resp
            .headers()
            .get(CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        Ok(RangeResponse {
            status: resp.status().as_u16(),
            content_range,
            body: resp
                .bytes_stream()
                .map(|chunk| chunk.map_err(FetchError::from))
                .boxed(),
        })
    }

    async fn fetch_all(&self, url: &str) -> Result<BodyStream, FetchError> {
        let resp = self.client.get(url).send().await?.error_for_status()?;
        Ok(resp
            .bytes_stream()
            .map(|chunk| chunk.map_err(FetchError::from))
            .boxed())
    }
}
