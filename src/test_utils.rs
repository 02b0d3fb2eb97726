//! Test utilities shared by unit tests and benchmarks
//!
//! Multipart body builders, a tiny JPEG encoder, and scripted stand-ins for
//! the source, decoder, and cache seams.

#![cfg(any(test, feature = "benchmark"))]

use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::cache::FrameCache;
use crate::decoder::FrameDecoder;
use crate::source::{FrameSource, SourceStream};
use crate::types::{CacheKey, DecodedImage};
use crate::{Result, StreamError};

/// One multipart part with `Content-Length`
pub fn multipart_part(boundary: &str, payload: &[u8]) -> Vec<u8> {
    let mut part = format!(
        "--{}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        boundary,
        payload.len()
    )
    .into_bytes();
    part.extend_from_slice(payload);
    part.extend_from_slice(b"\r\n");
    part
}

/// Concatenated parts, one per payload
pub fn multipart_body(boundary: &str, payloads: &[Vec<u8>]) -> Vec<u8> {
    payloads.iter().flat_map(|payload| multipart_part(boundary, payload)).collect()
}

/// Encode a small gradient JPEG
pub fn encode_test_jpeg(width: u32, height: u32, quality: u8) -> Vec<u8> {
    let mut pixels = Vec::with_capacity((width * height * 3) as usize);
    for y in 0..height {
        for x in 0..width {
            pixels.push((x * 255 / width.max(1)) as u8);
            pixels.push((y * 255 / height.max(1)) as u8);
            pixels.push(128);
        }
    }

    let mut out = Vec::new();
    image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100))
        .encode(&pixels, width, height, image::ExtendedColorType::Rgb8)
        .expect("encoding an in-memory RGB buffer cannot fail");
    out
}

/// Multipart body of `count` real JPEGs; the n-th is `n + 1` pixels wide
pub fn jpeg_multipart(count: u64) -> Vec<u8> {
    let payloads: Vec<Vec<u8>> =
        (0..count).map(|n| encode_test_jpeg(n as u32 + 1, 4, 80)).collect();
    multipart_body("frame", &payloads)
}

/// Payload understood by [`TaggedDecoder`]
pub fn tagged_payload(index: u64) -> Vec<u8> {
    format!("frame:{}", index).into_bytes()
}

/// Multipart body of `count` tagged frames starting at `start`
///
/// Offsets listed in `corrupt` carry a payload the decoder rejects.
pub fn tagged_multipart(start: u64, count: u64, corrupt: &[u64]) -> Vec<u8> {
    let payloads: Vec<Vec<u8>> = (0..count)
        .map(|n| if corrupt.contains(&n) { b"corrupt".to_vec() } else { tagged_payload(start + n) })
        .collect();
    multipart_body("frame", &payloads)
}

/// Index carried by an image produced by [`TaggedDecoder`]
pub fn image_tag(image: &DecodedImage) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&image.pixels[..8]);
    u64::from_le_bytes(raw)
}

/// Decoder for `frame:<n>` payloads; the image carries `n` in its pixels
#[derive(Debug, Clone, Copy, Default)]
pub struct TaggedDecoder;

impl FrameDecoder for TaggedDecoder {
    fn decode(&self, index: u64, data: &[u8]) -> Result<DecodedImage> {
        let tag = std::str::from_utf8(data)
            .ok()
            .and_then(|text| text.strip_prefix("frame:"))
            .and_then(|n| n.parse::<u64>().ok())
            .ok_or_else(|| StreamError::decode_failed(index, "not a tagged frame"))?;
        Ok(DecodedImage::new(2, 1, tag.to_le_bytes().to_vec()))
    }
}

/// What a [`ScriptedSource`] does for one `open`
#[derive(Debug, Clone)]
pub enum Script {
    /// Serve these chunks, then end the body unless `hold_open`
    Body { chunks: Vec<Bytes>, hold_open: bool },

    /// Serve one chunk per `interval`, then keep the connection open
    Paced { chunks: Vec<Bytes>, interval: Duration },

    /// Refuse the connection
    Refuse(String),

    /// Never answer
    Hang,
}

impl Script {
    /// Serve `body` in uneven chunks and close
    pub fn body(body: Vec<u8>) -> Self {
        Script::Body { chunks: uneven_chunks(body), hold_open: false }
    }

    /// Serve `body` in uneven chunks and keep the connection open
    pub fn held_open(body: Vec<u8>) -> Self {
        Script::Body { chunks: uneven_chunks(body), hold_open: true }
    }

    /// Serve `count` tagged frames from `start`, one every `interval`
    pub fn paced_frames(start: u64, count: u64, interval: Duration) -> Self {
        let chunks = (start..start + count)
            .map(|index| Bytes::from(multipart_part("frame", &tagged_payload(index))))
            .collect();
        Script::Paced { chunks, interval }
    }
}

fn uneven_chunks(body: Vec<u8>) -> Vec<Bytes> {
    let body = Bytes::from(body);
    let sizes = [7usize, 61, 3, 128, 19];
    let mut chunks = Vec::new();
    let mut offset = 0;
    let mut n = 0;
    while offset < body.len() {
        let end = (offset + sizes[n % sizes.len()]).min(body.len());
        chunks.push(body.slice(offset..end));
        offset = end;
        n += 1;
    }
    chunks
}

struct ConnectionGuard {
    active: Arc<AtomicUsize>,
}

impl ConnectionGuard {
    fn open(active: &Arc<AtomicUsize>, max: &AtomicUsize) -> Self {
        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
        max.fetch_max(now, Ordering::SeqCst);
        Self { active: Arc::clone(active) }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

type ScriptFn = dyn Fn(u64) -> Script + Send + Sync;

/// Frame source driven by a per-start-index script
///
/// Records every requested start index and tracks how many connections are
/// open at once.
pub struct ScriptedSource {
    script: Box<ScriptFn>,
    opens: Mutex<Vec<u64>>,
    active: Arc<AtomicUsize>,
    max_active: AtomicUsize,
}

impl ScriptedSource {
    pub fn new<F>(script: F) -> Self
    where
        F: Fn(u64) -> Script + Send + Sync + 'static,
    {
        Self {
            script: Box::new(script),
            opens: Mutex::new(Vec::new()),
            active: Arc::new(AtomicUsize::new(0)),
            max_active: AtomicUsize::new(0),
        }
    }

    /// Start indices requested so far, in order
    pub fn opens(&self) -> Vec<u64> {
        self.opens.lock().clone()
    }

    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn max_concurrent_connections(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl FrameSource for ScriptedSource {
    async fn open(&self, _origin: &str, start_index: u64) -> Result<SourceStream> {
        self.opens.lock().push(start_index);

        match (self.script)(start_index) {
            Script::Refuse(reason) => Err(StreamError::connection_failed(reason)),
            Script::Hang => std::future::pending().await,
            Script::Body { chunks, hold_open } => {
                let body = futures::stream::iter(chunks.into_iter().map(Ok));
                let body = if hold_open {
                    body.chain(futures::stream::pending::<Result<Bytes>>()).boxed()
                } else {
                    body.boxed()
                };
                Ok(self.guarded(body))
            }
            Script::Paced { chunks, interval } => {
                let body = futures::stream::iter(chunks)
                    .then(move |chunk| async move {
                        tokio::time::sleep(interval).await;
                        Ok::<_, StreamError>(chunk)
                    })
                    .chain(futures::stream::pending::<Result<Bytes>>())
                    .boxed();
                Ok(self.guarded(body))
            }
        }
    }
}

impl ScriptedSource {
    /// Count `body` as an open connection for as long as it lives
    fn guarded(&self, body: BoxStream<'static, Result<Bytes>>) -> SourceStream {
        let guard = ConnectionGuard::open(&self.active, &self.max_active);
        let chunks = body
            .map(move |chunk| {
                let _connection = &guard;
                chunk
            })
            .boxed();
        SourceStream::new(None, chunks)
    }
}

fn unavailable(key: &CacheKey) -> StreamError {
    StreamError::cache_failed(key.storage_key(), std::io::Error::other("cache volume unavailable"))
}

/// Cache whose every operation fails
#[derive(Debug, Clone, Copy, Default)]
pub struct FailingCache;

#[async_trait::async_trait]
impl FrameCache for FailingCache {
    async fn get(&self, key: &CacheKey) -> Result<Option<Bytes>> {
        Err(unavailable(key))
    }

    async fn put(&self, key: &CacheKey, _data: Bytes) -> Result<()> {
        Err(unavailable(key))
    }
}

/// Cache that answers every operation after `delay`, and never hits
#[derive(Debug, Clone, Copy)]
pub struct SlowCache {
    pub delay: Duration,
}

#[async_trait::async_trait]
impl FrameCache for SlowCache {
    async fn get(&self, _key: &CacheKey) -> Result<Option<Bytes>> {
        tokio::time::sleep(self.delay).await;
        Ok(None)
    }

    async fn put(&self, _key: &CacheKey, _data: Bytes) -> Result<()> {
        tokio::time::sleep(self.delay).await;
        Ok(())
    }
}
