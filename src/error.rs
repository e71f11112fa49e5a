//! Error types returned by the session facade.
//!
//! [`FacadeError`] is what callers see. Engine backends report
//! [`EngineError`](crate::engine::EngineError), which is mapped into a
//! facade error at the facade boundary so that every failure carries one of
//! the documented kinds.

use crate::engine::EngineError;
use crate::model::session::SessionState;

/// Result type alias using [`FacadeError`].
pub type Result<T> = std::result::Result<T, FacadeError>;

/// Errors surfaced by [`SessionContext`](crate::SessionContext) operations.
#[derive(Debug, thiserror::Error)]
pub enum FacadeError {
    /// Bad caller input. Never retried.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The remote description was rejected. Surfaced as-is, not retried.
    #[error("negotiation error: {0}")]
    Negotiation(String),

    /// The engine did not finish in time. The session is left untouched and
    /// the caller may retry with backoff.
    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Unrecoverable transport failure. The session has moved to `Failed`.
    #[error("fatal transport error: {0}")]
    TransportFatal(String),

    /// The operation is not allowed in the session's current state.
    #[error("{operation} not allowed in state {state:?}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },
}

/// Coarse classification of a [`FacadeError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Negotiation,
    Timeout,
    TransportFatal,
    InvalidState,
}

impl FacadeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FacadeError::Configuration(_) => ErrorKind::Configuration,
            FacadeError::Negotiation(_) => ErrorKind::Negotiation,
            FacadeError::Timeout(_) => ErrorKind::Timeout,
            FacadeError::TransportFatal(_) => ErrorKind::TransportFatal,
            FacadeError::InvalidState { .. } => ErrorKind::InvalidState,
        }
    }

    /// Only timeouts may be retried by the caller.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FacadeError::Timeout(_))
    }

    /// Whether this error moved (or must move) the session to `Failed`.
    pub fn is_fatal(&self) -> bool {
        matches!(self, FacadeError::TransportFatal(_))
    }
}

impl From<EngineError> for FacadeError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Configuration(msg) => FacadeError::Configuration(msg),
            EngineError::MalformedDescription(msg) => FacadeError::Negotiation(msg),
            EngineError::Fatal(msg) => FacadeError::TransportFatal(msg),
            EngineError::Io(e) => FacadeError::TransportFatal(e.to_string()),
            EngineError::Released => FacadeError::TransportFatal("engine released".into()),
        }
    }
}
