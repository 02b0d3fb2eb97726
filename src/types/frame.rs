//! Frame envelope and decoded image types

use bytes::Bytes;
use std::fmt;
use std::sync::Arc;

/// Decoded RGBA8 bitmap ready for the display surface
#[derive(Clone, PartialEq, Eq)]
pub struct DecodedImage {
    /// Width in pixels
    pub width: u32,

    /// Height in pixels
    pub height: u32,

    /// Row-major RGBA8 pixels (zero-copy via Arc)
    pub pixels: Arc<[u8]>,
}

impl DecodedImage {
    /// Create a new decoded image
    pub fn new(width: u32, height: u32, pixels: Vec<u8>) -> Self {
        Self { width, height, pixels: pixels.into() }
    }

    /// Size of the pixel buffer in bytes
    pub fn byte_len(&self) -> usize {
        self.pixels.len()
    }
}

impl fmt::Debug for DecodedImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecodedImage")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.pixels.len())
            .finish()
    }
}

/// One unit of streamed video data
///
/// Created the moment the splitter finds a complete part. The raw payload is
/// what gets cached; the decoded image is attached once decoding succeeds and
/// is never persisted.
#[derive(Debug, Clone)]
pub struct FrameEnvelope {
    /// Position of this frame within the overall video
    pub logical_index: u64,

    /// Encoded JPEG payload
    pub raw: Bytes,

    /// Decoded bitmap, present once decoded
    pub image: Option<Arc<DecodedImage>>,
}

impl FrameEnvelope {
    /// Create an envelope for a freshly split payload
    pub fn new(logical_index: u64, raw: Bytes) -> Self {
        Self { logical_index, raw, image: None }
    }

    /// Attach the decoded image
    pub fn with_image(mut self, image: DecodedImage) -> Self {
        self.image = Some(Arc::new(image));
        self
    }

    /// Whether the frame has been decoded
    pub fn is_decoded(&self) -> bool {
        self.image.is_some()
    }
}
