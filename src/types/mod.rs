//! Core types for streamed frame representation.
//!
//! ## Architecture
//!
//! - [`FrameEnvelope`] is one split frame: its logical index, the raw JPEG
//!   payload (zero-copy via [`bytes::Bytes`]) and, once decoded, the image
//! - [`DecodedImage`] is an RGBA8 bitmap shared via `Arc`
//! - [`CacheKey`] addresses one frame of one origin in the frame cache
//! - [`SessionId`] / [`StreamSession`] identify and describe one connection
//! - [`PlaybackState`] is the immutable snapshot the display surface observes
//! - [`UpdateRate`] limits how often observers see state changes
//!
//! ## Usage Example
//!
//! ```rust
//! use bytes::Bytes;
//! use framewire::types::{CacheKey, FrameEnvelope};
//!
//! let envelope = FrameEnvelope::new(50, Bytes::from_static(b"\xFF\xD8...\xFF\xD9"));
//! let key = CacheKey::new("http://127.0.0.1:8080/stream", envelope.logical_index);
//! assert_eq!(key.storage_key(), "http://127.0.0.1:8080/stream#50");
//! assert!(!envelope.is_decoded());
//! ```

mod cache_key;
mod frame;
mod playback;
mod session;
mod update_rate;

pub use cache_key::CacheKey;
pub use frame::{DecodedImage, FrameEnvelope};
pub use playback::{FrameOrigin, PlaybackPhase, PlaybackState};
pub use session::{SessionId, StreamSession};
pub use update_rate::UpdateRate;
