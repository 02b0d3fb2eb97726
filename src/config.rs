//! Pipeline configuration
//!
//! Every field has a default, so a YAML document only needs to name what it
//! overrides:
//!
//! ```rust
//! use framewire::StreamConfig;
//!
//! let config = StreamConfig::from_yaml_str("boundary: preview\nseek_window: 4\n").unwrap();
//! assert_eq!(config.boundary, "preview");
//! assert_eq!(config.seek_window, 4);
//! assert_eq!(config.start_param, "start_frame");
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::{Result, StreamError};

/// Hard ceiling on the splitter's accumulating buffer
pub const DEFAULT_MAX_BUFFER_BYTES: usize = 20 * 1024 * 1024;

/// Configuration for sessions, caches and the playback controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Multipart boundary token, without the leading `--`
    pub boundary: String,

    /// Query parameter carrying the start frame
    pub start_param: String,

    /// Splitter buffer ceiling
    pub max_buffer_bytes: usize,

    pub connect_timeout_ms: u64,

    /// Longest allowed gap between body chunks
    pub read_timeout_ms: u64,

    /// Cache reads slower than this count as misses
    pub cache_read_timeout_ms: u64,

    /// Session event channel capacity
    pub event_buffer: usize,

    /// Frames decoded concurrently per session
    pub decode_concurrency: usize,

    /// Forward distance a seek may be from the stream's next frame and still reuse it
    pub seek_window: u64,

    /// Frames kept streaming past the paused position before the connection is dropped
    pub paused_prefetch_frames: u64,

    /// Entries kept by the in-memory cache tier
    pub memory_cache_entries: usize,

    /// Disk cache directory; platform cache dir when unset
    pub cache_dir: Option<PathBuf>,

    /// Nominal stream frame rate, used to normalize observer update rates
    pub frame_rate: f64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            boundary: "frame".to_string(),
            start_param: "start_frame".to_string(),
            max_buffer_bytes: DEFAULT_MAX_BUFFER_BYTES,
            connect_timeout_ms: 5_000,
            read_timeout_ms: 10_000,
            cache_read_timeout_ms: 250,
            event_buffer: 16,
            decode_concurrency: 2,
            seek_window: 12,
            paused_prefetch_frames: 48,
            memory_cache_entries: 240,
            cache_dir: None,
            frame_rate: 30.0,
        }
    }
}

impl StreamConfig {
    /// Parse and validate a YAML document
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: StreamConfig = serde_yaml_ng::from_str(yaml)
            .map_err(|e| StreamError::config(format!("YAML parsing failed: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a YAML file
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let yaml = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| StreamError::io_error(path, e))?;
        debug!(path = %path.display(), "Loaded stream configuration");
        Self::from_yaml_str(&yaml)
    }

    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.boundary.is_empty() {
            return Err(StreamError::config("boundary must not be empty"));
        }
        if self.boundary.starts_with("--") {
            return Err(StreamError::config("boundary must not include the leading '--'"));
        }
        if self.start_param.is_empty() {
            return Err(StreamError::config("start_param must not be empty"));
        }
        if self.max_buffer_bytes == 0 {
            return Err(StreamError::config("max_buffer_bytes must be positive"));
        }
        if self.connect_timeout_ms == 0
            || self.read_timeout_ms == 0
            || self.cache_read_timeout_ms == 0
        {
            return Err(StreamError::config("timeouts must be positive"));
        }
        if self.event_buffer == 0 {
            return Err(StreamError::config("event_buffer must be positive"));
        }
        if self.decode_concurrency == 0 {
            return Err(StreamError::config("decode_concurrency must be positive"));
        }
        if self.memory_cache_entries == 0 {
            return Err(StreamError::config("memory_cache_entries must be positive"));
        }
        if !(self.frame_rate.is_finite() && self.frame_rate > 0.0) {
            return Err(StreamError::config("frame_rate must be a positive number"));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn cache_read_timeout(&self) -> Duration {
        Duration::from_millis(self.cache_read_timeout_ms)
    }

    /// Disk cache directory to use
    pub fn resolved_cache_dir(&self) -> PathBuf {
        match &self.cache_dir {
            Some(dir) => dir.clone(),
            None => dirs::cache_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("framewire")
                .join("frames"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = StreamConfig::default();
        config.validate().expect("defaults must validate");
        assert_eq!(config.max_buffer_bytes, 20 * 1024 * 1024);
        assert_eq!(config.connect_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn partial_yaml_keeps_defaults() {
        let config = StreamConfig::from_yaml_str(
            "connect_timeout_ms: 750\ncache_dir: /tmp/frames\npaused_prefetch_frames: 0\n",
        )
        .unwrap();
        assert_eq!(config.connect_timeout(), Duration::from_millis(750));
        assert_eq!(config.cache_dir, Some(PathBuf::from("/tmp/frames")));
        assert_eq!(config.resolved_cache_dir(), PathBuf::from("/tmp/frames"));
        assert_eq!(config.paused_prefetch_frames, 0);
        assert_eq!(config.boundary, "frame");
    }

    #[test]
    fn invalid_values_are_rejected() {
        for yaml in [
            "boundary: ''",
            "boundary: '--frame'",
            "max_buffer_bytes: 0",
            "decode_concurrency: 0",
            "frame_rate: 0.0",
            "read_timeout_ms: 0",
            "cache_read_timeout_ms: 0",
            "event_buffer: 0",
        ] {
            let err = StreamConfig::from_yaml_str(yaml).unwrap_err();
            assert!(matches!(err, StreamError::Config { .. }), "{yaml} should be rejected");
        }
    }

    #[test]
    fn malformed_yaml_is_a_config_error() {
        let err = StreamConfig::from_yaml_str("seek_window: [1, 2").unwrap_err();
        assert!(err.to_string().contains("YAML parsing failed"));
    }

    #[tokio::test]
    async fn loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("framewire.yaml");
        tokio::fs::write(&path, "boundary: preview\n").await.unwrap();

        let config = StreamConfig::from_file(&path).await.unwrap();
        assert_eq!(config.boundary, "preview");

        let missing = StreamConfig::from_file(dir.path().join("missing.yaml")).await.unwrap_err();
        assert!(matches!(missing, StreamError::Io { .. }));
    }
}
