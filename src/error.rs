//! Error types for the frame streaming pipeline.
//!
//! All errors implement `std::error::Error` and carry structured context for
//! logging and for the user-visible message shown by the playback surface.
//!
//! ## Error Categories
//!
//! - **Connection Errors**: request failures, non-success responses, stalls
//! - **Protocol Errors**: malformed multipart parts, unbounded buffer growth
//! - **Decode Errors**: corrupt or truncated JPEG payloads
//! - **Cache Errors**: disk store read/write failures (never reach playback)
//! - **Configuration Errors**: invalid settings
//!
//! ## Recovery and Retry
//!
//! ```rust
//! use framewire::StreamError;
//!
//! let error = StreamError::connection_failed("connection refused");
//! if error.is_retryable() {
//!     for suggestion in error.recovery_suggestions() {
//!         println!("  - {}", suggestion);
//!     }
//! }
//! assert_eq!(
//!     error.user_message(),
//!     "stream error: Failed to connect to frame source: connection refused"
//! );
//! ```

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for pipeline operations.
pub type Result<T, E = StreamError> = std::result::Result<T, E>;

/// Main error type for the frame streaming pipeline.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum StreamError {
    #[error("Failed to connect to frame source: {reason}")]
    Connection {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Frame source {url} responded with HTTP {status}")]
    HttpStatus { url: String, status: u16 },

    #[error("{operation} timed out after {duration:?}")]
    Timeout { operation: String, duration: Duration },

    #[error("Protocol error in {context}: {details}")]
    Protocol { context: String, details: String },

    #[error("Frame buffer exceeded {limit} bytes ({buffered} buffered) without a complete frame")]
    BufferOverflow { limit: usize, buffered: usize },

    #[error("Failed to decode frame {index}: {details}")]
    Decode { index: u64, details: String },

    #[error("Frame cache error for {key}")]
    Cache {
        key: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Invalid configuration: {details}")]
    Config { details: String },

    #[error("I/O error: {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Playback session has been shut down")]
    SessionClosed,
}

impl StreamError {
    /// Returns whether this error is potentially recoverable through retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            StreamError::Connection { .. } => true,
            StreamError::Timeout { .. } => true,
            StreamError::HttpStatus { status, .. } => *status >= 500 || *status == 429,
            StreamError::BufferOverflow { .. } => true,
            StreamError::Cache { .. } => true,
            StreamError::Io { .. } => true,
            StreamError::Protocol { .. } => false,
            StreamError::Decode { .. } => false,
            StreamError::Config { .. } => false,
            StreamError::SessionClosed => false,
        }
    }

    /// Returns suggested recovery actions for this error.
    pub fn recovery_suggestions(&self) -> Vec<&'static str> {
        match self {
            StreamError::Connection { .. } => vec![
                "Check that the preview server is running",
                "Verify the stream origin address",
                "Retry playback",
            ],
            StreamError::HttpStatus { .. } => vec![
                "Check the server logs for the failing request",
                "Verify the start frame is within the timeline",
                "Retry playback",
            ],
            StreamError::Timeout { .. } => vec![
                "Increase the connection or read timeout",
                "Check network and server load",
                "Retry playback",
            ],
            StreamError::Protocol { .. } => vec![
                "Verify the server emits multipart parts with Content-Length headers",
                "Check the configured boundary marker",
            ],
            StreamError::BufferOverflow { .. } => vec![
                "Check the configured boundary marker matches the server",
                "Increase max_buffer_bytes for very large frames",
                "Retry playback",
            ],
            StreamError::Decode { .. } => vec![
                "Verify the server encodes frames as baseline JPEG",
                "Seek to a neighbouring frame",
            ],
            StreamError::Cache { .. } => vec![
                "Check free disk space in the cache directory",
                "Check cache directory permissions",
            ],
            StreamError::Config { .. } => vec![
                "Check configuration values are non-zero",
                "Compare with the documented defaults",
            ],
            StreamError::Io { .. } => vec![
                "Check the path exists and is readable",
                "Check file permissions",
            ],
            StreamError::SessionClosed => vec!["Create a new playback controller"],
        }
    }

    /// Text suitable for the playback surface's error banner.
    pub fn user_message(&self) -> String {
        format!("stream error: {}", self)
    }

    /// Helper constructor for connection errors.
    pub fn connection_failed(reason: impl Into<String>) -> Self {
        StreamError::Connection { reason: reason.into(), source: None }
    }

    /// Helper constructor for connection errors with source.
    pub fn connection_failed_with_source(
        reason: impl Into<String>,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        StreamError::Connection { reason: reason.into(), source: Some(source) }
    }

    /// Helper constructor for timeouts.
    pub fn timeout(operation: impl Into<String>, duration: Duration) -> Self {
        StreamError::Timeout { operation: operation.into(), duration }
    }

    /// Helper constructor for multipart protocol errors.
    pub fn protocol(context: impl Into<String>, details: impl Into<String>) -> Self {
        StreamError::Protocol { context: context.into(), details: details.into() }
    }

    /// Helper constructor for decode faults.
    pub fn decode_failed(index: u64, details: impl Into<String>) -> Self {
        StreamError::Decode { index, details: details.into() }
    }

    /// Helper constructor for cache faults.
    pub fn cache_failed(
        key: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        StreamError::Cache { key: key.into(), source: source.into() }
    }

    /// Helper constructor for configuration errors.
    pub fn config(details: impl Into<String>) -> Self {
        StreamError::Config { details: details.into() }
    }

    /// Helper constructor for I/O errors with path context.
    pub fn io_error(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StreamError::Io { path: path.into(), source }
    }
}

impl From<std::io::Error> for StreamError {
    fn from(err: std::io::Error) -> Self {
        StreamError::Io { path: PathBuf::from("<unknown>"), source: err }
    }
}

impl From<reqwest::Error> for StreamError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return StreamError::HttpStatus {
                url: err.url().map(|u| u.to_string()).unwrap_or_default(),
                status: status.as_u16(),
            };
        }
        let reason = if err.is_connect() {
            "connection could not be established".to_string()
        } else if err.is_body() || err.is_decode() {
            "response body interrupted".to_string()
        } else {
            "request failed".to_string()
        };
        StreamError::Connection { reason, source: Some(Box::new(err)) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn error_messages_contain_their_context(
                reason in ".*",
                details in ".*",
                index in 0u64..1_000_000u64,
                status in 100u16..600u16,
            ) {
                let connection = StreamError::connection_failed(reason.clone());
                prop_assert!(connection.to_string().contains(&reason));

                let decode = StreamError::decode_failed(index, details.clone());
                let decode_msg = decode.to_string();
                prop_assert!(decode_msg.contains(&index.to_string()));
                prop_assert!(decode_msg.contains(&details));

                let http = StreamError::HttpStatus { url: "http://host/stream".into(), status };
                prop_assert!(http.to_string().contains(&status.to_string()));

                prop_assert!(connection.user_message().starts_with("stream error: "));
            }

            #[test]
            fn io_conversion_preserves_message(reason in ".*") {
                let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, reason.clone());
                let converted: StreamError = io_err.into();
                match converted {
                    StreamError::Io { source, .. } => prop_assert_eq!(source.to_string(), reason),
                    _ => prop_assert!(false, "Expected Io error from io::Error conversion"),
                }
            }

            #[test]
            fn server_errors_are_retryable_client_errors_are_not(status in 400u16..600u16) {
                let err = StreamError::HttpStatus { url: String::new(), status };
                prop_assert_eq!(err.is_retryable(), status >= 500 || status == 429);
            }
        }
    }

    #[test]
    fn error_traits_validation() {
        fn assert_send_sync_static<T: Send + Sync + 'static>() {}
        assert_send_sync_static::<StreamError>();

        let error = StreamError::connection_failed("test");
        let _: &dyn std::error::Error = &error;
    }

    #[test]
    fn classification_matches_recovery_policy() {
        assert!(StreamError::connection_failed("refused").is_retryable());
        assert!(StreamError::timeout("connect", Duration::from_secs(5)).is_retryable());
        assert!(StreamError::BufferOverflow { limit: 10, buffered: 11 }.is_retryable());
        assert!(!StreamError::decode_failed(3, "truncated").is_retryable());
        assert!(!StreamError::protocol("part header", "missing length").is_retryable());
        assert!(!StreamError::config("zero").is_retryable());

        for err in [
            StreamError::connection_failed("x"),
            StreamError::decode_failed(1, "x"),
            StreamError::SessionClosed,
        ] {
            let suggestions = err.recovery_suggestions();
            assert!(!suggestions.is_empty());
            assert!(suggestions.iter().all(|s| s.len() > 5));
        }
    }

    #[test]
    fn source_chain_is_preserved() {
        let io = std::io::Error::other("disk full");
        let err = StreamError::cache_failed("http://a#1", io);
        let source = std::error::Error::source(&err).expect("cache error carries a source");
        assert_eq!(source.to_string(), "disk full");
    }

    #[test]
    fn timeout_message_names_operation() {
        let err = StreamError::timeout("connect", Duration::from_millis(1500));
        assert_eq!(err.to_string(), "connect timed out after 1.5s");
    }
}
