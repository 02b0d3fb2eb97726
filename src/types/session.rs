//! Stream session identifiers and snapshots

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque identifier of one network connection's lifetime
///
/// Used for log correlation and to drop events from superseded sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[cfg_attr(feature = "tauri", derive(specta::Type))]
pub struct SessionId(u64);

impl SessionId {
    /// Allocate the next process-unique id
    pub fn next() -> Self {
        Self(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric value
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// Snapshot of one stream session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSession {
    /// Session identifier
    pub id: SessionId,

    /// Origin the session is connected to
    pub origin: String,

    /// Index the remote source was asked to start from
    pub start_index: u64,

    /// Frames produced so far
    pub frames_emitted: u64,

    /// False once cancelled, failed or ended
    pub is_active: bool,
}

impl StreamSession {
    /// Index the next produced frame will carry
    pub fn next_index(&self) -> u64 {
        self.start_index + self.frames_emitted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_ids_are_unique_and_increasing() {
        let a = SessionId::next();
        let b = SessionId::next();
        assert!(b > a);
        assert_ne!(a.to_string(), b.to_string());
    }

    #[test]
    fn next_index_follows_counter() {
        let session = StreamSession {
            id: SessionId::next(),
            origin: "http://host/stream".into(),
            start_index: 50,
            frames_emitted: 3,
            is_active: true,
        };
        assert_eq!(session.next_index(), 53);
    }
}
