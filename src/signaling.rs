//! HTTP offer/answer exchange.
//!
//! The simplest possible signaling: POST the local description to a server as
//! JSON and read the remote description back from the response body. The
//! envelope matches the browser's `RTCSessionDescriptionInit`, so a few lines
//! of JavaScript on the other side are enough to answer.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::model::description::{LocalDescription, RemoteDescription};

#[derive(Debug, thiserror::Error)]
pub enum SignalingError {
    #[error("signaling server: {0}")]
    Http(#[from] reqwest::Error),

    #[error("expected an answer, got '{0}'")]
    UnexpectedType(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub sdp: String,
}

impl SignalMessage {
    pub fn offer(local: &LocalDescription) -> Self {
        Self {
            kind: "offer".into(),
            sdp: local.as_str().to_string(),
        }
    }

    pub fn into_answer(self) -> Result<RemoteDescription, SignalingError> {
        if self.kind != "answer" {
            return Err(SignalingError::UnexpectedType(self.kind));
        }
        Ok(RemoteDescription::new(self.sdp))
    }
}

/// Sends `offer` to the signaling server at `url` and returns its answer.
pub async fn exchange(url: &str, offer: &LocalDescription) -> Result<RemoteDescription, SignalingError> {
    let client = reqwest::Client::new();
    info!("Posting offer to {}", url);

    let answer: SignalMessage = client
        .post(url)
        .json(&SignalMessage::offer(offer))
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;

    info!("Received {} from signaling server", answer.kind);
    answer.into_answer()
}
