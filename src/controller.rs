//! Playback position controller
//!
//! Keeps one logical "current frame" in step with user seeks and the frames
//! arriving from the network. All decisions happen in a single actor task
//! that owns the [`StreamingFrameSession`]; the [`PlaybackController`] handle
//! only sends commands and reads the published [`PlaybackState`].
//!
//! ```text
//! Idle --seek/play--> Buffering --frame--> Ready(playing|paused)
//!                         ^                   |
//!                         +--- far seek ------+
//! any --session error--> Error --retry/seek/play--> Buffering
//! any --stop--> Idle
//! ```
//!
//! While paused, a connection keeps streaming (and caching) for
//! `paused_prefetch_frames` past the current position, then is closed.

use futures::stream::BoxStream;
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::cache::CacheHandle;
use crate::decoder::{FrameDecoder, decode_blocking};
use crate::session::{SessionEvent, StreamingFrameSession};
use crate::source::FrameSource;
use crate::stream::ThrottleExt;
use crate::types::{
    CacheKey, DecodedImage, FrameEnvelope, FrameOrigin, PlaybackPhase, PlaybackState, UpdateRate,
};
use crate::{Result, StreamConfig, StreamError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Seek(u64),
    Play,
    Pause,
    Stop,
    Retry,
    SetTotalFrames(u64),
}

/// Handle to a running playback actor
///
/// Dropping the handle stops the actor and closes its connection.
pub struct PlaybackController {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<PlaybackState>,
    frame_rate: f64,
    cancel: CancellationToken,
}

impl PlaybackController {
    /// Spawn a controller for `origin`
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::Config`] if `config` fails validation.
    pub fn spawn(
        origin: impl Into<String>,
        config: StreamConfig,
        source: Arc<dyn FrameSource>,
        cache: CacheHandle,
        decoder: Arc<dyn FrameDecoder>,
    ) -> Result<Self> {
        config.validate()?;
        let origin = origin.into();
        let config = Arc::new(config);
        let frame_rate = config.frame_rate;

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(PlaybackState::default());
        let cancel = CancellationToken::new();

        let session = StreamingFrameSession::new(
            source,
            Arc::clone(&decoder),
            cache.clone(),
            Arc::clone(&config),
        );

        let actor = Actor {
            origin: origin.clone(),
            config,
            cache,
            decoder,
            session,
            commands: command_rx,
            state_tx,
            state: PlaybackState::default(),
            pending_target: None,
            deferred_seek: None,
            connecting: false,
            next_expected: None,
            resume_playing: false,
            cancel: cancel.clone(),
        };
        tokio::spawn(actor.run());

        info!(origin, "Playback controller spawned");
        Ok(Self { commands: command_tx, state: state_rx, frame_rate, cancel })
    }

    /// Show frame `index`, from the cache when possible
    pub fn seek(&self, index: u64) -> Result<()> {
        self.send(Command::Seek(index))
    }

    pub fn play(&self) -> Result<()> {
        self.send(Command::Play)
    }

    pub fn pause(&self) -> Result<()> {
        self.send(Command::Pause)
    }

    /// Close the connection and return to idle
    pub fn stop(&self) -> Result<()> {
        self.send(Command::Stop)
    }

    /// Re-issue the failed request; ignored outside the error phase
    pub fn retry(&self) -> Result<()> {
        self.send(Command::Retry)
    }

    /// Upper bound for seeks (0 = unknown)
    pub fn set_total_frames(&self, total: u64) -> Result<()> {
        self.send(Command::SetTotalFrames(total))
    }

    /// Current state snapshot
    pub fn state(&self) -> PlaybackState {
        self.state.borrow().clone()
    }

    /// Wait for the next state change
    pub async fn changed(&mut self) -> Result<PlaybackState> {
        self.state.changed().await.map_err(|_| StreamError::SessionClosed)?;
        Ok(self.state.borrow_and_update().clone())
    }

    /// Wait until the state satisfies `predicate`, checking the current state first
    pub async fn wait_for(
        &self,
        mut predicate: impl FnMut(&PlaybackState) -> bool,
    ) -> Result<PlaybackState> {
        let mut rx = self.state.clone();
        let state = rx
            .wait_for(|state| predicate(state))
            .await
            .map_err(|_| StreamError::SessionClosed)?
            .clone();
        Ok(state)
    }

    /// Stream of states: the current one, then every change
    ///
    /// With [`UpdateRate::Max`] below the frame rate, changes are throttled
    /// with latest-wins semantics.
    pub fn state_updates(&self, rate: UpdateRate) -> BoxStream<'static, PlaybackState> {
        let states = WatchStream::new(self.state.clone());
        match rate.throttle_interval(self.frame_rate) {
            None => states.boxed(),
            Some(interval) => states.throttle(interval).boxed(),
        }
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands.send(command).map_err(|_| StreamError::SessionClosed)
    }
}

impl Drop for PlaybackController {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for PlaybackController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaybackController")
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

/// Drop every queued seek except the latest, keeping other commands in order
fn coalesce(first: Command, queue: &mut mpsc::UnboundedReceiver<Command>) -> Vec<Command> {
    let mut batch = vec![first];
    while let Ok(command) = queue.try_recv() {
        batch.push(command);
    }

    let last_seek = batch.iter().rposition(|c| matches!(c, Command::Seek(_)));
    batch
        .into_iter()
        .enumerate()
        .filter(|(i, c)| !matches!(c, Command::Seek(_)) || Some(*i) == last_seek)
        .map(|(_, c)| c)
        .collect()
}

/// Whether `target` is at most `window` frames ahead of `next`
fn within_window(next: u64, target: u64, window: u64) -> bool {
    next <= target && target <= next.saturating_add(window)
}

struct Actor {
    origin: String,
    config: Arc<StreamConfig>,
    cache: CacheHandle,
    decoder: Arc<dyn FrameDecoder>,
    session: StreamingFrameSession,
    commands: mpsc::UnboundedReceiver<Command>,
    state_tx: watch::Sender<PlaybackState>,
    state: PlaybackState,

    /// Frame the display is waiting for
    pending_target: Option<u64>,

    /// Latest seek received while a connection was initializing
    deferred_seek: Option<u64>,

    /// Current connection has produced neither a frame nor a failure yet
    connecting: bool,

    /// Index the current connection delivers next
    next_expected: Option<u64>,

    /// Play intent when the last failure happened
    resume_playing: bool,

    cancel: CancellationToken,
}

impl Actor {
    async fn run(mut self) {
        info!(origin = %self.origin, "Playback actor started");

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    debug!("Playback actor cancelled");
                    break;
                }
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        debug!("Controller handle dropped");
                        break;
                    };
                    for command in coalesce(command, &mut self.commands) {
                        self.handle(command).await;
                    }
                }
                event = self.session.next_event(), if self.session.is_receiving() => {
                    match event {
                        Some(event) => self.on_event(event).await,
                        None => trace!("Session event channel closed"),
                    }
                }
            }
        }

        self.session.cancel();
        info!(origin = %self.origin, "Playback actor stopped");
    }

    async fn handle(&mut self, command: Command) {
        debug!(?command, phase = ?self.state.phase, "Handling command");
        match command {
            Command::Seek(index) => self.seek(index).await,
            Command::Play => self.play().await,
            Command::Pause => self.pause(),
            Command::Stop => self.stop(),
            Command::Retry => self.retry().await,
            Command::SetTotalFrames(total) => {
                self.state.total_frame_count = total;
                self.publish();
            }
        }
    }

    async fn seek(&mut self, requested: u64) {
        let target = self.clamp(requested);

        if self.connecting && self.state.phase == PlaybackPhase::Buffering {
            debug!(target, "Connection still initializing, deferring seek");
            self.deferred_seek = Some(target);
            return;
        }

        self.state.current_frame_index = target;
        self.state.error_message = None;

        if let Some(image) = self.cached_image(target).await {
            self.pending_target = None;
            self.show(target, Arc::new(image), FrameOrigin::Cache);
            if self.state.is_playing {
                self.continue_from(target + 1).await;
            } else if !self.stream_covers(target + 1) {
                self.session.cancel();
            }
            self.publish();
            return;
        }

        if self.stream_covers(target) {
            debug!(target, next = ?self.next_expected, "Target is ahead on the open stream");
            self.pending_target = Some(target);
            self.state.phase = PlaybackPhase::Buffering;
            self.publish();
            return;
        }

        self.begin_session(target, true).await;
        self.publish();
    }

    async fn play(&mut self) {
        self.state.is_playing = true;

        match self.state.phase {
            PlaybackPhase::Buffering => {}
            PlaybackPhase::Idle | PlaybackPhase::Error => {
                self.state.error_message = None;
                let start = self.state.current_frame_index;
                self.begin_session(start, true).await;
            }
            PlaybackPhase::Ready => {
                let next = self.state.current_frame_index + 1;
                self.continue_from(next).await;
            }
        }
        self.publish();
    }

    fn pause(&mut self) {
        self.state.is_playing = false;
        debug!(
            index = self.state.current_frame_index,
            paused = self.state.is_paused(),
            "Playback paused"
        );
        self.publish();
    }

    fn stop(&mut self) {
        self.session.cancel();
        self.pending_target = None;
        self.deferred_seek = None;
        self.connecting = false;
        self.next_expected = None;

        self.state = PlaybackState {
            current_frame_index: self.state.current_frame_index,
            total_frame_count: self.state.total_frame_count,
            ..PlaybackState::default()
        };
        info!(origin = %self.origin, "Playback stopped");
        self.publish();
    }

    async fn retry(&mut self) {
        if self.state.phase != PlaybackPhase::Error {
            debug!(phase = ?self.state.phase, "Retry ignored outside the error phase");
            return;
        }
        info!(index = self.state.current_frame_index, "Retrying playback");
        self.state.is_playing = self.resume_playing;
        self.seek(self.state.current_frame_index).await;
    }

    async fn on_event(&mut self, event: SessionEvent) {
        if Some(event.session()) != self.session.current_id() {
            trace!(session = %event.session(), "Ignoring event from a superseded session");
            return;
        }
        self.connecting = false;
        if !matches!(event, SessionEvent::Frame { .. }) {
            self.next_expected = None;
        }

        match event {
            SessionEvent::Frame { envelope, .. } => self.on_frame(envelope),
            SessionEvent::Error { error, .. } => {
                warn!(error = %error, retryable = error.is_retryable(), "Playback session failed");
                self.fail(error.user_message());
            }
            SessionEvent::Ended { frames, .. } => self.on_ended(frames),
        }

        if let Some(target) = self.deferred_seek.take() {
            debug!(target, "Applying deferred seek");
            self.seek(target).await;
        }
    }

    fn on_frame(&mut self, envelope: FrameEnvelope) {
        let index = envelope.logical_index;
        self.next_expected = Some(index + 1);
        let Some(image) = envelope.image else { return };

        let visible = match self.pending_target {
            Some(target) => index >= target,
            None => self.state.is_playing && index > self.state.current_frame_index,
        };

        if visible {
            self.pending_target = None;
            self.show(index, image, FrameOrigin::Network);
            self.publish();
            return;
        }

        if !self.state.is_playing && self.pending_target.is_none() {
            let limit =
                self.state.current_frame_index.saturating_add(self.config.paused_prefetch_frames);
            if index >= limit {
                debug!(index, limit, "Paused prefetch complete, closing connection");
                self.session.cancel();
            }
        }
    }

    fn on_ended(&mut self, frames: u64) {
        info!(frames, "Frame stream ended");

        if let Some(target) = self.pending_target.take() {
            self.fail(format!("stream ended before frame {}", target));
            return;
        }

        self.state.is_playing = false;
        if self.state.is_initialized {
            self.state.phase = PlaybackPhase::Ready;
        }
        self.publish();
    }

    fn fail(&mut self, message: String) {
        self.resume_playing = self.state.is_playing;
        self.pending_target = None;

        self.state.phase = PlaybackPhase::Error;
        self.state.is_playing = false;
        self.state.displayed_image = None;
        self.state.frame_origin = FrameOrigin::None;
        self.state.error_message = Some(message);
        self.publish();
    }

    /// Keep playing from `next`, reusing the open stream when it is close enough
    async fn continue_from(&mut self, next: u64) {
        let total = self.state.total_frame_count;
        if total > 0 && next >= total {
            debug!(next, total, "Already at the last frame");
            self.state.is_playing = false;
            return;
        }
        if self.stream_covers(next) {
            return;
        }
        self.begin_session(next, false).await;
    }

    /// Replace the connection with one starting at `start`
    async fn begin_session(&mut self, start: u64, await_target: bool) {
        let id = self.session.start(&self.origin, start).await;
        self.state.session_id = Some(id);
        self.connecting = true;
        self.next_expected = Some(start);

        if await_target {
            self.pending_target = Some(start);
            self.state.phase = PlaybackPhase::Buffering;
        }
    }

    fn stream_covers(&self, index: u64) -> bool {
        let window = self.config.seek_window;
        self.session.is_receiving()
            && self.next_expected.is_some_and(|next| within_window(next, index, window))
    }

    async fn cached_image(&self, index: u64) -> Option<DecodedImage> {
        let raw = self.cache.get(&CacheKey::new(self.origin.clone(), index)).await?;
        match decode_blocking(Arc::clone(&self.decoder), index, raw).await {
            Ok(image) => Some(image),
            Err(e) => {
                warn!(index, error = %e, "Cached frame failed to decode, refetching");
                None
            }
        }
    }

    fn show(&mut self, index: u64, image: Arc<DecodedImage>, origin: FrameOrigin) {
        trace!(index, ?origin, "Displaying frame");
        self.state.phase = PlaybackPhase::Ready;
        self.state.is_initialized = true;
        self.state.current_frame_index = index;
        self.state.displayed_image = Some(image);
        self.state.frame_origin = origin;
        self.state.error_message = None;
    }

    fn clamp(&self, index: u64) -> u64 {
        match self.state.total_frame_count {
            0 => index,
            total => index.min(total - 1),
        }
    }

    fn publish(&self) {
        self.state_tx.send_replace(self.state.clone());
    }
}
