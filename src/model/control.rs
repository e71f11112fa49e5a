//! Call-control frames exchanged with the remote peer.
//!
//! The native backend carries these over its `control` data channel. Frames
//! are bincode encoded and stamped with the sender's wall clock so the
//! receiving side can log one-way latency.

use std::collections::BTreeMap;

use bincode::config::{self, Configuration};
use chrono::{TimeZone, Utc};

use crate::model::session::MediaAttributes;

const BINCODE_CONFIG: Configuration = config::standard();

/// DTMF tones accepted by [`ControlMessage::Dtmf`].
pub const DTMF_TONES: &str = "0123456789*#ABCD";

#[derive(Debug, Clone, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub enum ControlMessage {
    /// The sender's media attributes changed.
    Media(MediaAttributes),
    /// A single DTMF tone.
    Dtmf(char),
    /// Application-defined key/value parameters.
    CustomParameters(BTreeMap<String, String>),
    /// The sender is ending the call.
    Bye(Option<String>),
}

impl ControlMessage {
    pub fn is_valid_dtmf(tone: char) -> bool {
        DTMF_TONES.contains(tone.to_ascii_uppercase())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct ControlFrame {
    pub message: ControlMessage,
    pub timestamp: i64,
}

impl ControlFrame {
    pub fn new(message: ControlMessage) -> ControlFrame {
        Self {
            message,
            timestamp: Utc::now().timestamp_nanos_opt().unwrap_or(0),
        }
    }

    pub fn timestamp(&self) -> String {
        Utc.timestamp_nanos(self.timestamp).to_rfc3339()
    }

    pub fn latency(&self) -> String {
        (Utc::now() - Utc.timestamp_nanos(self.timestamp)).to_string()
    }

    pub fn encode(&self) -> Result<Vec<u8>, bincode::error::EncodeError> {
        bincode::encode_to_vec(self, BINCODE_CONFIG)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, bincode::error::DecodeError> {
        let (frame, _): (ControlFrame, usize) = bincode::decode_from_slice(bytes, BINCODE_CONFIG)?;
        Ok(frame)
    }
}
