//! Session identity, lifecycle and media attributes.

use std::{
    fmt,
    ops::Deref,
    sync::atomic::{AtomicU64, Ordering},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::engine::Backend;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(u64);

impl SessionId {
    pub(crate) fn next() -> SessionId {
        static ID_COUNTER: AtomicU64 = AtomicU64::new(1);
        SessionId(ID_COUNTER.fetch_add(1, Ordering::SeqCst))
    }
}

impl Deref for SessionId {
    type Target = u64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Lifecycle of a session.
///
/// ```text
/// Connecting ──► Connected ──► Closed
///     │  └──────────────────────▲
///     └──────► Failed ◄─────┘ (from Connected)
/// ```
///
/// `Closed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Connecting,
    Connected,
    Closed,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }

    /// Whether the lifecycle allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Connecting, Connected) | (Connecting, Closed) | (Connecting, Failed)
                | (Connected, Closed)
                | (Connected, Failed)
        )
    }
}

/// Media state of a session as seen by the local side.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub struct MediaAttributes {
    pub audio_muted: bool,
    pub video_muted: bool,
    pub video_sending: bool,
    pub held: bool,
}

/// Read-only snapshot of a session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub state: SessionState,
    pub backend: Backend,
    pub opened_at: DateTime<Utc>,
    pub media: MediaAttributes,
    /// Last attributes the remote peer announced, if any.
    pub remote_media: Option<MediaAttributes>,
    pub close_reason: Option<String>,
}
