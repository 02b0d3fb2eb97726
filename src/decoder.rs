//! Frame decoding
//!
//! Decoding is CPU-bound, so sessions run it on tokio's blocking pool via
//! [`decode_blocking`]. The trait is the seam for swapping in a hardware or
//! test decoder.

use std::sync::Arc;
use tracing::trace;

use crate::types::DecodedImage;
use crate::{Result, StreamError};

/// Decodes one raw encoded frame into a displayable bitmap
pub trait FrameDecoder: Send + Sync + 'static {
    /// Decode `data`, the payload of frame `index`
    ///
    /// Corrupt or truncated input is a [`StreamError::Decode`]; callers
    /// skip the frame rather than ending the session.
    fn decode(&self, index: u64, data: &[u8]) -> Result<DecodedImage>;
}

/// JPEG decoder backed by the `image` crate
#[derive(Debug, Clone, Copy, Default)]
pub struct JpegDecoder;

impl JpegDecoder {
    pub fn new() -> Self {
        Self
    }
}

impl FrameDecoder for JpegDecoder {
    fn decode(&self, index: u64, data: &[u8]) -> Result<DecodedImage> {
        if data.is_empty() {
            return Err(StreamError::decode_failed(index, "empty payload"));
        }

        let image = image::load_from_memory_with_format(data, image::ImageFormat::Jpeg)
            .map_err(|e| StreamError::decode_failed(index, e.to_string()))?
            .to_rgba8();

        let (width, height) = image.dimensions();
        trace!(index, width, height, "Decoded frame");
        Ok(DecodedImage::new(width, height, image.into_raw()))
    }
}

/// Decode on the blocking pool
pub async fn decode_blocking(
    decoder: Arc<dyn FrameDecoder>,
    index: u64,
    data: bytes::Bytes,
) -> Result<DecodedImage> {
    tokio::task::spawn_blocking(move || decoder.decode(index, &data))
        .await
        .map_err(|e| StreamError::decode_failed(index, format!("decode task failed: {}", e)))?
}
