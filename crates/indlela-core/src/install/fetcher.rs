//! Artifact transport.
//!
//! The pipeline pulls bytes through the [`ArtifactFetcher`] seam; the
//! default implementation streams over HTTP. Tests substitute their own
//! fetcher to drive the state machine without a network.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use tracing::debug;

use crate::config::InstallConfig;
use crate::error::{Error, Result};

/// Byte stream of one artifact body.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Response to a fetch: declared length (when the transport knows it) and
/// the body stream.
pub struct FetchResponse {
    pub total_bytes: Option<u64>,
    pub stream: ByteStream,
}

impl std::fmt::Debug for FetchResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchResponse")
            .field("total_bytes", &self.total_bytes)
            .finish()
    }
}

/// Transport used to pull artifact bytes.
#[async_trait]
pub trait ArtifactFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchResponse>;
}

/// Streaming HTTP fetcher.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: &InstallConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| Error::download(format!("failed to create HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ArtifactFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchResponse> {
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(Error::download(format!("invalid url scheme: {url}")));
        }
        debug!(url, "fetching artifact");

        let response = self
            .client
            .get(url)
            .header("User-Agent", concat!("indlela/", env!("CARGO_PKG_VERSION")))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Error::download(format!(
                "HTTP {} for {url}",
                response.status()
            )));
        }

        let total_bytes = response.content_length();
        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(Error::from));

        Ok(FetchResponse {
            total_bytes,
            stream: Box::pin(stream),
        })
    }
}

/// Join the artifact base URL with a manifest-relative path.
pub fn artifact_url(base_url: &str, path: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), path)
}
