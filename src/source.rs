//! Frame sources
//!
//! A [`FrameSource`] opens one connection for `(origin, start_index)` and
//! hands back the raw body as a chunk stream. Sources do no framing of their
//! own; the session feeds the chunks through the multipart splitter.

use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use tracing::{debug, info};

use crate::splitter::boundary_from_content_type;
use crate::{Result, StreamConfig, StreamError};

/// Body chunks of one connection
pub type ChunkStream = BoxStream<'static, Result<Bytes>>;

/// An opened connection
pub struct SourceStream {
    /// Boundary announced by the server, if any
    pub boundary: Option<String>,

    /// Raw body chunks
    pub chunks: ChunkStream,
}

impl SourceStream {
    pub fn new(boundary: Option<String>, chunks: ChunkStream) -> Self {
        Self { boundary, chunks }
    }
}

impl std::fmt::Debug for SourceStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceStream").field("boundary", &self.boundary).finish_non_exhaustive()
    }
}

/// Opens frame connections
///
/// Returns:
/// - `Ok(stream)` - connection established; the stream ends when the server closes it
/// - `Err(e)` - request failed or the server refused it
#[async_trait::async_trait]
pub trait FrameSource: Send + Sync + 'static {
    /// Open a connection emitting frames from `start_index` onwards
    async fn open(&self, origin: &str, start_index: u64) -> Result<SourceStream>;
}

/// HTTP source: `GET {origin}?{start_param}={start_index}`
#[derive(Debug, Clone)]
pub struct HttpFrameSource {
    client: reqwest::Client,
    start_param: String,
}

impl HttpFrameSource {
    /// Build a source using the configured connect timeout and start parameter
    pub fn new(config: &StreamConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .build()
            .map_err(|e| {
                StreamError::connection_failed_with_source("HTTP client setup failed", Box::new(e))
            })?;
        Ok(Self::with_client(client, &config.start_param))
    }

    /// Build a source around an existing client
    pub fn with_client(client: reqwest::Client, start_param: &str) -> Self {
        Self { client, start_param: start_param.to_string() }
    }

    /// Request URL for a start index
    pub fn request_url(&self, origin: &str, start_index: u64) -> Result<reqwest::Url> {
        let mut url = reqwest::Url::parse(origin).map_err(|e| {
            let reason = format!("invalid origin '{}'", origin);
            StreamError::connection_failed_with_source(reason, Box::new(e))
        })?;
        url.query_pairs_mut().append_pair(&self.start_param, &start_index.to_string());
        Ok(url)
    }
}

#[async_trait::async_trait]
impl FrameSource for HttpFrameSource {
    async fn open(&self, origin: &str, start_index: u64) -> Result<SourceStream> {
        let url = self.request_url(origin, start_index)?;
        debug!(url = %url, "Requesting frame stream");

        let response = self.client.get(url.clone()).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(StreamError::HttpStatus { url: url.to_string(), status: status.as_u16() });
        }

        let boundary = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .and_then(boundary_from_content_type);

        info!(url = %url, status = status.as_u16(), boundary = ?boundary, "Frame stream opened");

        let chunks = response.bytes_stream().map(|chunk| chunk.map_err(StreamError::from)).boxed();
        Ok(SourceStream::new(boundary, chunks))
    }
}
