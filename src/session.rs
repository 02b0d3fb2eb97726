//! Streaming frame session
//!
//! Owns at most one live connection. Each connection runs in its own task:
//!
//! ```text
//! source chunks -> read timeout -> splitter -> index -> decode (ordered) -> cache + events
//! ```
//!
//! Indices are assigned by counting split frames from the requested start,
//! never taken from the server. Cancelling drops the event receiver in the
//! same call, so nothing a superseded connection produced can be observed
//! afterwards.

use futures::{Stream, StreamExt};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::cache::CacheHandle;
use crate::decoder::{FrameDecoder, decode_blocking};
use crate::source::{ChunkStream, FrameSource};
use crate::splitter::{MultipartSplitter, SplitFramesExt};
use crate::types::{CacheKey, FrameEnvelope, SessionId, StreamSession};
use crate::{Result, StreamConfig, StreamError};

/// Event produced by a session
#[derive(Debug)]
pub enum SessionEvent {
    /// A decoded frame
    Frame { session: SessionId, envelope: FrameEnvelope },

    /// The connection failed; no further events follow
    Error { session: SessionId, error: StreamError },

    /// The server closed the stream; no further events follow
    Ended { session: SessionId, frames: u64 },
}

impl SessionEvent {
    /// Session that produced this event
    pub fn session(&self) -> SessionId {
        match self {
            SessionEvent::Frame { session, .. } => *session,
            SessionEvent::Error { session, .. } => *session,
            SessionEvent::Ended { session, .. } => *session,
        }
    }
}

#[derive(Debug, Default)]
struct Progress {
    frames_emitted: AtomicU64,
    active: AtomicBool,
}

struct ActiveConnection {
    id: SessionId,
    origin: String,
    start_index: u64,
    progress: Arc<Progress>,
    cancel: CancellationToken,
    events: Option<mpsc::Receiver<SessionEvent>>,
    task: Option<JoinHandle<()>>,
}

impl ActiveConnection {
    fn snapshot(&self) -> StreamSession {
        StreamSession {
            id: self.id,
            origin: self.origin.clone(),
            start_index: self.start_index,
            frames_emitted: self.progress.frames_emitted.load(Ordering::Acquire),
            is_active: self.progress.active.load(Ordering::Acquire),
        }
    }
}

/// Turns one connection at a time into indexed, decoded frames
pub struct StreamingFrameSession {
    source: Arc<dyn FrameSource>,
    decoder: Arc<dyn FrameDecoder>,
    cache: CacheHandle,
    config: Arc<StreamConfig>,
    current: Option<ActiveConnection>,
}

impl StreamingFrameSession {
    pub fn new(
        source: Arc<dyn FrameSource>,
        decoder: Arc<dyn FrameDecoder>,
        cache: CacheHandle,
        config: Arc<StreamConfig>,
    ) -> Self {
        Self { source, decoder, cache, config, current: None }
    }

    /// Start streaming `origin` from `start_index`
    ///
    /// Any previous connection is cancelled and its task awaited before the
    /// new connection is opened, so two connections never overlap.
    pub async fn start(&mut self, origin: &str, start_index: u64) -> SessionId {
        self.cancel();
        if let Some(task) = self.current.take().and_then(|mut previous| previous.task.take()) {
            if let Err(e) = task.await {
                warn!("Previous session task ended abnormally: {}", e);
            }
        }

        let id = SessionId::next();
        let progress = Arc::new(Progress::default());
        progress.active.store(true, Ordering::Release);
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(self.config.event_buffer.max(1));

        let task = SessionTask {
            id,
            origin: origin.to_string(),
            start_index,
            source: Arc::clone(&self.source),
            decoder: Arc::clone(&self.decoder),
            cache: self.cache.clone(),
            config: Arc::clone(&self.config),
            progress: Arc::clone(&progress),
            cancel: cancel.clone(),
            tx,
        };
        let handle = tokio::spawn(task.run());

        info!(session = %id, origin, start_index, "Session started");

        self.current = Some(ActiveConnection {
            id,
            origin: origin.to_string(),
            start_index,
            progress,
            cancel,
            events: Some(rx),
            task: Some(handle),
        });
        id
    }

    /// Stop the current connection
    ///
    /// Idempotent. Buffered events are discarded and no further events of
    /// the cancelled connection are delivered.
    pub fn cancel(&mut self) {
        let Some(current) = self.current.as_mut() else { return };
        if current.events.is_none() && current.cancel.is_cancelled() {
            return;
        }
        current.cancel.cancel();
        current.events = None;
        current.progress.active.store(false, Ordering::Release);
        debug!(session = %current.id, "Session cancelled");
    }

    /// Next event of the current connection
    ///
    /// Returns `None` once the connection has finished or been cancelled, or
    /// when there is no connection.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        let current = self.current.as_mut()?;
        let events = current.events.as_mut()?;
        match events.recv().await {
            Some(event) => Some(event),
            None => {
                current.events = None;
                None
            }
        }
    }

    /// Whether [`next_event`](Self::next_event) can still yield events
    pub fn is_receiving(&self) -> bool {
        self.current.as_ref().is_some_and(|c| c.events.is_some())
    }

    /// Whether a connection is live
    pub fn is_active(&self) -> bool {
        self.current.as_ref().is_some_and(|c| c.progress.active.load(Ordering::Acquire))
    }

    /// Snapshot of the current (or last) connection
    pub fn current(&self) -> Option<StreamSession> {
        self.current.as_ref().map(ActiveConnection::snapshot)
    }

    /// Id of the current (or last) connection
    pub fn current_id(&self) -> Option<SessionId> {
        self.current.as_ref().map(|c| c.id)
    }
}

impl Drop for StreamingFrameSession {
    fn drop(&mut self) {
        if let Some(current) = &self.current {
            debug!(session = %current.id, "Dropping streaming session");
            current.cancel.cancel();
        }
    }
}

/// Everything one connection task owns
struct SessionTask {
    id: SessionId,
    origin: String,
    start_index: u64,
    source: Arc<dyn FrameSource>,
    decoder: Arc<dyn FrameDecoder>,
    cache: CacheHandle,
    config: Arc<StreamConfig>,
    progress: Arc<Progress>,
    cancel: CancellationToken,
    tx: mpsc::Sender<SessionEvent>,
}

impl SessionTask {
    async fn run(self) {
        let id = self.id;
        let connect_timeout = self.config.connect_timeout();

        let opened = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                debug!(session = %id, "Cancelled while connecting");
                self.progress.active.store(false, Ordering::Release);
                return;
            }
            opened = tokio::time::timeout(
                connect_timeout,
                self.source.open(&self.origin, self.start_index),
            ) => opened,
        };

        let stream = match opened {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return self.fail(e).await,
            Err(_) => return self.fail(StreamError::timeout("connect", connect_timeout)).await,
        };

        let splitter = MultipartSplitter::from_config(&self.config, stream.boundary.as_deref());
        let chunks = with_read_timeout(stream.chunks, self.config.read_timeout());

        let progress = Arc::clone(&self.progress);
        let mut next_index = self.start_index;
        let decoder = Arc::clone(&self.decoder);
        let mut pipeline = Box::pin(
            chunks
                .split_frames(splitter)
                .map(move |item| {
                    item.map(|raw| {
                        let envelope = FrameEnvelope::new(next_index, raw);
                        next_index += 1;
                        progress.frames_emitted.fetch_add(1, Ordering::AcqRel);
                        envelope
                    })
                })
                .map(move |item| {
                    let decoder = Arc::clone(&decoder);
                    async move {
                        let envelope = item?;
                        let index = envelope.logical_index;
                        let decoded = decode_blocking(decoder, index, envelope.raw.clone()).await;
                        Ok::<_, StreamError>((envelope, decoded))
                    }
                })
                .buffered(self.config.decode_concurrency.max(1)),
        );

        let mut delivered = 0u64;
        loop {
            let next: Option<Result<_>> = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    debug!(session = %id, delivered, "Session task cancelled");
                    break;
                }
                next = pipeline.next() => next,
            };

            match next {
                Some(Ok((envelope, Ok(image)))) => {
                    let index = envelope.logical_index;
                    self.cache.put(CacheKey::new(self.origin.clone(), index), envelope.raw.clone());
                    trace!(session = %id, index, "Delivering frame");

                    let envelope = envelope.with_image(image);
                    let event = SessionEvent::Frame { session: id, envelope };
                    if !self.deliver(event).await {
                        break;
                    }
                    delivered += 1;
                }
                Some(Ok((envelope, Err(e)))) => {
                    warn!(
                        session = %id,
                        index = envelope.logical_index,
                        error = %e,
                        "Skipping undecodable frame"
                    );
                }
                Some(Err(e)) => {
                    drop(pipeline);
                    return self.fail(e).await;
                }
                None => {
                    let frames = self.progress.frames_emitted.load(Ordering::Acquire);
                    info!(session = %id, frames, "Frame stream ended");
                    drop(pipeline);
                    self.progress.active.store(false, Ordering::Release);
                    self.deliver(SessionEvent::Ended { session: id, frames }).await;
                    return;
                }
            }
        }

        self.progress.active.store(false, Ordering::Release);
    }

    async fn fail(self, error: StreamError) {
        error!(session = %self.id, origin = %self.origin, error = %error, "Session failed");
        self.progress.active.store(false, Ordering::Release);
        self.deliver(SessionEvent::Error { session: self.id, error }).await;
    }

    /// Send unless cancelled; false when the receiver is gone
    async fn deliver(&self, event: SessionEvent) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            sent = self.tx.send(event) => sent.is_ok(),
        }
    }
}

/// Fail the body with a timeout when no chunk arrives within `read_timeout`
fn with_read_timeout(
    chunks: ChunkStream,
    read_timeout: std::time::Duration,
) -> impl Stream<Item = Result<bytes::Bytes>> + Send + 'static {
    futures::stream::unfold(Some(chunks), move |chunks| async move {
        let mut chunks = chunks?;
        match tokio::time::timeout(read_timeout, chunks.next()).await {
            Ok(Some(item)) => Some((item, Some(chunks))),
            Ok(None) => None,
            Err(_) => Some((Err(StreamError::timeout("read", read_timeout)), None)),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryFrameCache;
    use crate::decoder::JpegDecoder;
    use crate::test_utils::{
        Script, ScriptedSource, TaggedDecoder, jpeg_multipart, tagged_multipart,
    };
    use std::time::Duration;

    const ORIGIN: &str = "http://127.0.0.1:8080/stream";

    fn session_with(source: Arc<ScriptedSource>, config: StreamConfig) -> StreamingFrameSession {
        let decoder = Arc::new(TaggedDecoder);
        StreamingFrameSession::new(source, decoder, CacheHandle::disabled(), Arc::new(config))
    }

    fn scripted<F>(script: F) -> Arc<ScriptedSource>
    where
        F: Fn(u64) -> Script + Send + Sync + 'static,
    {
        Arc::new(ScriptedSource::new(script))
    }

    async fn drain(session: &mut StreamingFrameSession) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Some(event) = tokio::time::timeout(Duration::from_secs(5), session.next_event())
            .await
            .expect("session should not stall")
        {
            events.push(event);
        }
        events
    }

    fn frame_indices(events: &[SessionEvent]) -> Vec<u64> {
        events
            .iter()
            .filter_map(|e| match e {
                SessionEvent::Frame { envelope, .. } => Some(envelope.logical_index),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn indices_count_up_from_start() {
        let source = scripted(|start| Script::body(tagged_multipart(start, 6, &[])));
        let mut session = session_with(source.clone(), StreamConfig::default());

        let id = session.start(ORIGIN, 40).await;
        let events = drain(&mut session).await;

        assert_eq!(frame_indices(&events), vec![40, 41, 42, 43, 44, 45]);
        assert!(matches!(events.last(), Some(SessionEvent::Ended { frames: 6, .. })));
        assert!(events.iter().all(|e| e.session() == id));
        assert_eq!(source.opens(), vec![40]);

        let snapshot = session.current().unwrap();
        assert_eq!(snapshot.frames_emitted, 6);
        assert_eq!(snapshot.next_index(), 46);
        assert!(!snapshot.is_active);
    }

    #[tokio::test]
    async fn zero_sized_limits_still_deliver_frames() {
        let source = scripted(|start| Script::body(tagged_multipart(start, 3, &[])));
        let config =
            StreamConfig { event_buffer: 0, decode_concurrency: 0, ..StreamConfig::default() };
        let mut session = session_with(source, config);

        session.start(ORIGIN, 7).await;
        let events = drain(&mut session).await;

        assert_eq!(frame_indices(&events), vec![7, 8, 9]);
        assert!(matches!(events.last(), Some(SessionEvent::Ended { frames: 3, .. })));
    }

    #[tokio::test]
    async fn decode_faults_skip_the_frame_but_keep_indices() {
        let source = scripted(|start| Script::body(tagged_multipart(start, 4, &[1])));
        let mut session = session_with(source, StreamConfig::default());

        session.start(ORIGIN, 10).await;
        let events = drain(&mut session).await;

        assert_eq!(frame_indices(&events), vec![10, 12, 13]);
        assert!(!events.iter().any(|e| matches!(e, SessionEvent::Error { .. })));
    }

    #[tokio::test]
    async fn decoded_frames_are_written_to_the_cache() {
        let memory = Arc::new(MemoryFrameCache::new(16));
        let cache = CacheHandle::new(memory.clone(), Duration::from_millis(100));
        let source = scripted(|_| Script::body(jpeg_multipart(3)));
        let mut session = StreamingFrameSession::new(
            source,
            Arc::new(JpegDecoder::new()),
            cache.clone(),
            Arc::new(StreamConfig::default()),
        );

        session.start(ORIGIN, 5).await;
        let events = drain(&mut session).await;
        assert_eq!(frame_indices(&events), vec![5, 6, 7]);

        for index in 5..8 {
            let key = CacheKey::new(ORIGIN, index);
            let mut hit = None;
            for _ in 0..50 {
                hit = cache.get(&key).await;
                if hit.is_some() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
            assert!(hit.is_some(), "frame {index} should be cached");
        }
    }

    #[tokio::test]
    async fn cancel_is_idempotent_and_silences_the_session() {
        let source = scripted(|start| Script::held_open(tagged_multipart(start, 3, &[])));
        let mut session = session_with(source.clone(), StreamConfig::default());

        session.start(ORIGIN, 0).await;
        session.cancel();
        session.cancel();

        assert!(!session.is_active());
        assert!(!session.is_receiving());
        assert!(session.next_event().await.is_none());

        tokio::time::timeout(Duration::from_secs(2), async {
            while source.active_connections() > 0 {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("connection should close promptly after cancel");
    }

    #[tokio::test]
    async fn restarting_never_overlaps_connections() {
        let source = scripted(|start| Script::held_open(tagged_multipart(start, 2, &[])));
        let mut session = session_with(source.clone(), StreamConfig::default());

        let first = session.start(ORIGIN, 0).await;
        let event = session.next_event().await.unwrap();
        assert_eq!(event.session(), first);

        let second = session.start(ORIGIN, 50).await;
        assert_ne!(first, second);

        let event = session.next_event().await.unwrap();
        assert_eq!(event.session(), second);
        match event {
            SessionEvent::Frame { envelope, .. } => assert_eq!(envelope.logical_index, 50),
            other => panic!("expected a frame, got {other:?}"),
        }

        assert_eq!(source.opens(), vec![0, 50]);
        assert_eq!(source.max_concurrent_connections(), 1);
    }

    #[tokio::test]
    async fn overflow_emits_exactly_one_error() {
        let source = Arc::new(ScriptedSource::new(|_| {
            let mut chunks = vec![bytes::Bytes::from_static(b"--frame\r\nX-Junk: ")];
            chunks.extend((0..16).map(|_| bytes::Bytes::from(vec![b'j'; 64])));
            Script::Body { chunks, hold_open: true }
        }));
        let config = StreamConfig { max_buffer_bytes: 256, ..StreamConfig::default() };
        let mut session = session_with(source, config);

        session.start(ORIGIN, 0).await;
        let events = drain(&mut session).await;

        assert_eq!(events.len(), 1);
        assert!(matches!(
            events[0],
            SessionEvent::Error { error: StreamError::BufferOverflow { limit: 256, .. }, .. }
        ));
        assert!(!session.is_active());
    }

    #[tokio::test]
    async fn refused_connection_is_one_error_event() {
        let source = scripted(|_| Script::Refuse("HTTP 503".into()));
        let mut session = session_with(source, StreamConfig::default());

        session.start(ORIGIN, 0).await;
        let events = drain(&mut session).await;

        assert_eq!(events.len(), 1);
        assert!(matches!(
            events[0],
            SessionEvent::Error { error: StreamError::Connection { .. }, .. }
        ));
    }

    #[tokio::test]
    async fn connect_and_read_stalls_time_out() {
        let config =
            StreamConfig { connect_timeout_ms: 30, read_timeout_ms: 30, ..StreamConfig::default() };

        let hanging = scripted(|_| Script::Hang);
        let mut session = session_with(hanging, config.clone());
        session.start(ORIGIN, 0).await;
        let events = drain(&mut session).await;
        assert!(matches!(
            &events[..],
            [SessionEvent::Error { error: StreamError::Timeout { .. }, .. }]
        ));

        let stalled = scripted(|start| Script::held_open(tagged_multipart(start, 1, &[])));
        let mut session = session_with(stalled, config);
        session.start(ORIGIN, 0).await;
        let events = drain(&mut session).await;
        assert_eq!(frame_indices(&events), vec![0]);
        assert!(matches!(
            events.last(),
            Some(SessionEvent::Error { error: StreamError::Timeout { .. }, .. })
        ));
    }
}
