//! Multipart frame splitting
//!
//! Turns the body of an MJPEG-style `multipart/x-mixed-replace` response into
//! discrete JPEG payloads. Each part looks like:
//!
//! ```text
//! --frame\r\n
//! Content-Type: image/jpeg\r\n
//! Content-Length: 5120\r\n
//! \r\n
//! <5120 bytes>\r\n
//! ```
//!
//! Parts are delimited by `Content-Length`, never by scanning the payload,
//! so payload bytes that happen to contain the boundary are harmless.
//!
//! ```rust
//! use bytes::Bytes;
//! use framewire::splitter::MultipartSplitter;
//!
//! let mut splitter = MultipartSplitter::new("frame", 1024);
//! splitter.push(b"--frame\r\nContent-Length: 4\r\n\r\nabcd");
//! splitter.push(b"--frame\r\nContent-Length: 3\r\n\r\nxyz");
//! assert_eq!(splitter.next_frame().unwrap(), Some(Bytes::from_static(b"abcd")));
//! assert_eq!(splitter.next_frame().unwrap(), Some(Bytes::from_static(b"xyz")));
//! assert_eq!(splitter.next_frame().unwrap(), None);
//! ```

use bytes::{Buf, Bytes, BytesMut};
use futures::{Stream, ready};
use pin_project_lite::pin_project;
use std::pin::Pin;
use std::task::{Context, Poll};
use tracing::{debug, trace, warn};

use crate::{Result, StreamConfig, StreamError};

const HEADER_END: &[u8] = b"\r\n\r\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SplitState {
    /// Looking for the next boundary marker
    Boundary,
    /// Boundary consumed, looking for the blank line; `scanned` bytes hold no terminator
    Header { scanned: usize },
    /// Header consumed, waiting for `len` payload bytes
    Body { len: usize },
}

/// Incremental splitter for one connection's multipart body
///
/// Not restartable: create one per connection.
#[derive(Debug)]
pub struct MultipartSplitter {
    buffer: BytesMut,
    marker: Vec<u8>,
    max_buffer_bytes: usize,
    state: SplitState,
    /// Bytes dropped since the last part with a usable header
    discarded: usize,
    frames: u64,
    anomalies: u64,
    poisoned: bool,
}

impl MultipartSplitter {
    /// Create a splitter for `boundary` (without the leading `--`)
    pub fn new(boundary: &str, max_buffer_bytes: usize) -> Self {
        let mut marker = Vec::with_capacity(boundary.len() + 2);
        marker.extend_from_slice(b"--");
        marker.extend_from_slice(boundary.as_bytes());

        Self {
            buffer: BytesMut::new(),
            marker,
            max_buffer_bytes,
            state: SplitState::Boundary,
            discarded: 0,
            frames: 0,
            anomalies: 0,
            poisoned: false,
        }
    }

    /// Create a splitter from configuration, preferring a server-announced boundary
    pub fn from_config(config: &StreamConfig, announced_boundary: Option<&str>) -> Self {
        let boundary = announced_boundary.unwrap_or(&config.boundary);
        Self::new(boundary, config.max_buffer_bytes)
    }

    /// Append a chunk received from the connection
    pub fn push(&mut self, chunk: &[u8]) {
        if self.poisoned {
            return;
        }
        self.buffer.extend_from_slice(chunk);
    }

    /// Extract the next complete payload
    ///
    /// Returns `Ok(None)` when more bytes are needed. Returns
    /// [`StreamError::BufferOverflow`] once if more than the ceiling arrives
    /// without a part header carrying a usable `Content-Length`, counting
    /// discarded noise; the splitter is unusable afterwards.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>> {
        if self.poisoned {
            return Ok(None);
        }

        loop {
            match self.state {
                SplitState::Boundary => {
                    match find_subslice(&self.buffer, &self.marker) {
                        Some(pos) => {
                            if pos > 0 {
                                trace!(skipped = pos, "Discarding bytes before boundary");
                            }
                            self.discarded += pos + self.marker.len();
                            self.buffer.advance(pos + self.marker.len());
                            self.state = SplitState::Header { scanned: 0 };
                        }
                        None => {
                            // Keep a marker-sized tail in case the marker straddles chunks
                            let keep = self.marker.len() - 1;
                            if self.buffer.len() > keep {
                                let stale = self.buffer.len() - keep;
                                self.discarded += stale;
                                self.buffer.advance(stale);
                            }
                            return self.need_more();
                        }
                    }
                }
                SplitState::Header { scanned } => {
                    let Some(rel) = find_subslice(&self.buffer[scanned..], HEADER_END) else {
                        let scanned = self.buffer.len().saturating_sub(HEADER_END.len() - 1);
                        self.state = SplitState::Header { scanned };
                        return self.need_more();
                    };

                    let header_end = scanned + rel;
                    let content_length = parse_content_length(&self.buffer[..header_end]);
                    self.buffer.advance(header_end + HEADER_END.len());

                    match content_length {
                        Some(len) if len > self.max_buffer_bytes => {
                            return Err(self.overflow(len));
                        }
                        Some(len) => {
                            self.discarded = 0;
                            self.state = SplitState::Body { len };
                        }
                        None => {
                            self.discarded += header_end + HEADER_END.len();
                            self.anomalies += 1;
                            let anomaly = StreamError::protocol(
                                "multipart part header",
                                "missing, non-numeric or non-positive Content-Length",
                            );
                            warn!(
                                anomalies = self.anomalies,
                                error = %anomaly,
                                "Skipping multipart part"
                            );
                            self.state = SplitState::Boundary;
                        }
                    }
                }
                SplitState::Body { len } => {
                    if self.buffer.len() < len {
                        return self.need_more();
                    }

                    let frame = self.buffer.split_to(len).freeze();
                    self.frames += 1;
                    self.state = SplitState::Boundary;
                    trace!(frame = self.frames, bytes = len, "Split frame");
                    return Ok(Some(frame));
                }
            }
        }
    }

    /// Bytes received since the last resolvable part, including discarded ones
    fn unresolved(&self) -> usize {
        self.discarded + self.buffer.len()
    }

    fn need_more(&mut self) -> Result<Option<Bytes>> {
        let unresolved = self.unresolved();
        if unresolved > self.max_buffer_bytes {
            return Err(self.overflow(unresolved));
        }
        Ok(None)
    }

    fn overflow(&mut self, buffered: usize) -> StreamError {
        warn!(
            limit = self.max_buffer_bytes,
            bytes = buffered,
            "No resolvable frame within buffer ceiling"
        );
        self.buffer = BytesMut::new();
        self.discarded = 0;
        self.poisoned = true;
        StreamError::BufferOverflow { limit: self.max_buffer_bytes, buffered }
    }

    /// Called when the upstream ends; drops any incomplete part
    pub fn finish(&mut self) {
        if !self.buffer.is_empty() && self.state != SplitState::Boundary {
            debug!(bytes = self.buffer.len(), "Dropping incomplete trailing part");
        }
        self.buffer.clear();
    }

    /// Frames produced so far
    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Malformed parts skipped so far
    pub fn anomalies(&self) -> u64 {
        self.anomalies
    }

    /// Bytes currently held
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Whether an overflow has disabled this splitter
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }
}

/// Parse `Content-Length` out of a part header block
///
/// Header names match case-insensitively. Returns `None` for missing,
/// non-numeric or non-positive values.
pub fn parse_content_length(header: &[u8]) -> Option<usize> {
    header
        .split(|&b| b == b'\n')
        .filter_map(|line| std::str::from_utf8(line).ok())
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<i64>().ok())
        .filter(|&len| len > 0)
        .and_then(|len| usize::try_from(len).ok())
}

/// Extract the `boundary` parameter of a multipart `Content-Type` value
///
/// A leading `--` is stripped since some servers include it.
pub fn boundary_from_content_type(content_type: &str) -> Option<String> {
    let (mime, params) = content_type.split_once(';')?;
    if !mime.trim().to_ascii_lowercase().starts_with("multipart/") {
        return None;
    }
    params
        .split(';')
        .filter_map(|param| param.split_once('='))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("boundary"))
        .map(|(_, value)| value.trim().trim_matches('"'))
        .map(|value| value.strip_prefix("--").unwrap_or(value).to_string())
        .filter(|value| !value.is_empty())
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Extension trait to split any byte-chunk stream into frame payloads
pub trait SplitFramesExt: Stream<Item = Result<Bytes>> {
    /// Split the stream with the given splitter
    ///
    /// Upstream errors and splitter overflow are yielded once, after which
    /// the stream ends.
    fn split_frames(self, splitter: MultipartSplitter) -> SplitFrames<Self>
    where
        Self: Sized,
    {
        SplitFrames::new(self, splitter)
    }
}

impl<T: Stream<Item = Result<Bytes>>> SplitFramesExt for T {}

pin_project! {
    /// A stream combinator that yields complete multipart payloads
    pub struct SplitFrames<S> {
        #[pin]
        stream: S,
        splitter: MultipartSplitter,
        done: bool,
    }
}

impl<S> SplitFrames<S> {
    /// Create a new splitting stream
    pub fn new(stream: S, splitter: MultipartSplitter) -> Self {
        Self { stream, splitter, done: false }
    }

    /// The underlying splitter
    pub fn splitter(&self) -> &MultipartSplitter {
        &self.splitter
    }
}

impl<S: Stream<Item = Result<Bytes>>> Stream for SplitFrames<S> {
    type Item = Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();

        loop {
            if *this.done {
                return Poll::Ready(None);
            }

            match this.splitter.next_frame() {
                Ok(Some(frame)) => return Poll::Ready(Some(Ok(frame))),
                Ok(None) => {}
                Err(e) => {
                    *this.done = true;
                    return Poll::Ready(Some(Err(e)));
                }
            }

            match ready!(this.stream.as_mut().poll_next(cx)) {
                Some(Ok(chunk)) => this.splitter.push(&chunk),
                Some(Err(e)) => {
                    *this.done = true;
                    return Poll::Ready(Some(Err(e)));
                }
                None => {
                    *this.done = true;
                    this.splitter.finish();
                    return Poll::Ready(None);
                }
            }
        }
    }
}
