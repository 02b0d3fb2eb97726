//! Playback state published to the display surface

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::{DecodedImage, SessionId};

/// Phase of the playback state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "tauri", derive(specta::Type))]
#[serde(rename_all = "snake_case")]
pub enum PlaybackPhase {
    /// Nothing requested yet, or stopped
    #[default]
    Idle,

    /// Waiting for a connection to deliver the requested frame
    Buffering,

    /// A frame is on screen; playing or paused depending on intent
    Ready,

    /// The last session failed; waiting for a user action
    Error,
}

/// Where the displayed frame came from (diagnostics only)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "tauri", derive(specta::Type))]
#[serde(rename_all = "snake_case")]
pub enum FrameOrigin {
    #[default]
    None,
    Cache,
    Network,
    Unknown,
}

/// Immutable snapshot of the playback surface state
///
/// Replaced wholesale on every change and published through a watch channel.
#[derive(Debug, Clone, Default)]
pub struct PlaybackState {
    /// State machine phase
    pub phase: PlaybackPhase,

    /// A frame has been displayed since the last stop
    pub is_initialized: bool,

    /// Intent to play
    pub is_playing: bool,

    /// Index currently eligible for display
    pub current_frame_index: u64,

    /// Image on screen, if any
    pub displayed_image: Option<Arc<DecodedImage>>,

    /// Upper bound for seeking (0 if unknown)
    pub total_frame_count: u64,

    /// Source of the displayed frame
    pub frame_origin: FrameOrigin,

    /// User-visible message while in the error phase
    pub error_message: Option<String>,

    /// Session currently feeding this surface
    pub session_id: Option<SessionId>,
}

impl PlaybackState {
    /// Waiting on the network for the requested frame
    pub fn is_buffering(&self) -> bool {
        self.phase == PlaybackPhase::Buffering
    }

    /// Last session failed
    pub fn is_error(&self) -> bool {
        self.phase == PlaybackPhase::Error
    }

    /// Ready and not playing
    pub fn is_paused(&self) -> bool {
        self.phase == PlaybackPhase::Ready && !self.is_playing
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_state_is_idle_and_empty() {
        let state = PlaybackState::default();
        assert_eq!(state.phase, PlaybackPhase::Idle);
        assert!(!state.is_initialized);
        assert!(!state.is_buffering());
        assert!(!state.is_error());
        assert!(state.displayed_image.is_none());
        assert_eq!(state.frame_origin, FrameOrigin::None);
    }

    #[test]
    fn phases_serialize_as_snake_case() {
        let yaml = serde_yaml_ng::to_string(&PlaybackPhase::Buffering).unwrap();
        assert_eq!(yaml.trim(), "buffering");
        let origin: FrameOrigin = serde_yaml_ng::from_str("cache").unwrap();
        assert_eq!(origin, FrameOrigin::Cache);
    }
}
