//! Streaming MJPEG frame client with a disk-backed frame cache.
//!
//! Framewire turns a long-lived `multipart/x-mixed-replace` JPEG stream into
//! decoded frames addressed by logical index, caches every frame it sees, and
//! keeps a playback position in step with user seeks.
//!
//! # Pipeline
//!
//! ```text
//! HttpFrameSource -> MultipartSplitter -> FrameDecoder -> PlaybackController -> PlaybackState
//!                                              |                  ^
//!                                              v                  |
//!                                           FrameCache -----------+ (seeks)
//! ```
//!
//! - [`splitter`]: reassembles multipart parts from arbitrary chunk boundaries
//! - [`decoder`]: JPEG to RGBA, off the async threads
//! - [`cache`]: disk, memory and tiered frame stores behind a best-effort handle
//! - [`session`]: one connection at a time, indexed from the requested start
//! - [`controller`]: the playback state machine
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use framewire::{Framewire, StreamConfig, UpdateRate};
//! use futures::StreamExt;
//!
//! #[tokio::main]
//! async fn main() -> framewire::Result<()> {
//!     let origin = "http://127.0.0.1:8080/stream";
//!     let controller = Framewire::connect(origin, StreamConfig::default()).await?;
//!     controller.seek(120)?;
//!     controller.play()?;
//!
//!     let mut states = controller.state_updates(UpdateRate::Max(15));
//!     while let Some(state) = states.next().await {
//!         println!("{:?} at frame {}", state.phase, state.current_frame_index);
//!     }
//!     Ok(())
//! }
//! ```

// Core types and error handling
mod config;
mod error;
pub mod logging;
#[cfg_attr(any(test, feature = "benchmark"), path = "test_utils.rs")]
#[cfg(any(test, feature = "benchmark"))]
pub mod test_utils;
pub mod types;

// Pipeline
pub mod cache;
pub mod controller;
pub mod decoder;
pub mod session;
pub mod source;
pub mod splitter;
pub mod stream;

// Core exports
pub use config::*;
pub use error::*;
pub use types::*;

// Main API exports
pub use cache::{
    CacheHandle, DiskFrameCache, FrameCache, MemoryFrameCache, NoopFrameCache, TieredFrameCache,
};
pub use controller::PlaybackController;
pub use decoder::{FrameDecoder, JpegDecoder};
pub use session::{SessionEvent, StreamingFrameSession};
pub use source::{FrameSource, HttpFrameSource};
pub use splitter::MultipartSplitter;

use std::sync::Arc;
use tracing::{info, warn};

/// Unified entry point wiring the default pipeline.
///
/// Builds an HTTP source, a memory-over-disk cache and the JPEG decoder,
/// then spawns a [`PlaybackController`] for one origin.
///
/// # Examples
///
/// ```rust,no_run
/// use framewire::{Framewire, StreamConfig};
///
/// #[tokio::main]
/// async fn main() -> framewire::Result<()> {
///     let config = StreamConfig::from_file("framewire.yaml").await?;
///     let controller = Framewire::connect("http://127.0.0.1:8080/stream", config).await?;
///     controller.seek(0)?;
///     Ok(())
/// }
/// ```
pub struct Framewire;

impl Framewire {
    /// Spawn a controller for `origin` using the default source, cache and decoder.
    ///
    /// The disk tier lives under [`StreamConfig::resolved_cache_dir`]. If it
    /// cannot be opened, frames are cached in memory only.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The configuration fails validation
    /// - The HTTP client cannot be built
    pub async fn connect(
        origin: impl Into<String>,
        config: StreamConfig,
    ) -> Result<PlaybackController> {
        config.validate()?;
        let origin = origin.into();

        let source = Arc::new(HttpFrameSource::new(&config)?);
        let cache = Self::default_cache(&config).await;
        let decoder = Arc::new(JpegDecoder::new());

        info!(origin = %origin, "Connecting playback controller");
        PlaybackController::spawn(origin, config, source, cache, decoder)
    }

    /// Memory-over-disk cache, degrading to memory only when the disk tier is unavailable
    pub async fn default_cache(config: &StreamConfig) -> CacheHandle {
        let memory = Arc::new(MemoryFrameCache::new(config.memory_cache_entries));
        let dir = config.resolved_cache_dir();

        let store: Arc<dyn FrameCache> = match DiskFrameCache::open(&dir).await {
            Ok(disk) => Arc::new(TieredFrameCache::new(memory, Arc::new(disk))),
            Err(e) => {
                warn!(
                    dir = %dir.display(),
                    error = %e,
                    "Disk frame cache unavailable, caching in memory only"
                );
                memory
            }
        };
        CacheHandle::new(store, config.cache_read_timeout())
    }
}
