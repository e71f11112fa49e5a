//! Opaque session descriptions.
//!
//! The facade never looks inside these. Their format is owned by the engine
//! backend that produced (or must consume) them: SDP for the native backend,
//! JSON for the loopback backend.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Description produced locally by the engine when a session is opened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocalDescription(String);

/// Description received from the remote peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteDescription(String);

impl LocalDescription {
    pub fn new(blob: impl Into<String>) -> Self {
        Self(blob.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl RemoteDescription {
    pub fn new(blob: impl Into<String>) -> Self {
        Self(blob.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl From<&str> for RemoteDescription {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for RemoteDescription {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl fmt::Display for LocalDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for RemoteDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
