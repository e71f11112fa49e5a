//! Transport engine capability.
//!
//! The facade never does media or transport work itself. It holds one
//! [`TransportEngine`] per session, created by an injected
//! [`EngineProvider`]. Each supported backend is one implementation:
//!
//! * [`native`]: a real ICE/DTLS/SCTP peer on top of `str0m`.
//! * [`loopback`]: an in-process peer with scripted outcomes.

pub mod loopback;
pub mod native;

use std::fmt;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::config::SessionConfig;
use crate::model::control::ControlMessage;
use crate::model::description::{LocalDescription, RemoteDescription};

pub use loopback::{LoopbackControl, LoopbackProvider};
pub use native::NativeProvider;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Backend {
    Native,
    Loopback,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Native => f.write_str("native"),
            Backend::Loopback => f.write_str("loopback"),
        }
    }
}

/// Errors reported by an engine backend.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("engine configuration: {0}")]
    Configuration(String),

    #[error("malformed description: {0}")]
    MalformedDescription(String),

    #[error("{0}")]
    Fatal(String),

    #[error("network: {0}")]
    Io(#[from] std::io::Error),

    #[error("engine already released")]
    Released,
}

/// Asynchronous notifications from an engine after it connected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// The transport path was lost.
    Disconnected,
    /// The engine hit an unrecoverable error.
    Fatal(String),
    /// The remote peer sent a control message.
    Remote(ControlMessage),
}

/// Transport counters maintained by the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TransportStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// Creates one engine per session.
#[async_trait]
pub trait EngineProvider: Send + Sync {
    fn backend(&self) -> Backend;

    async fn create(&self, config: &SessionConfig) -> Result<Box<dyn TransportEngine>, EngineError>;
}

/// The capability a session holds on its engine.
///
/// Implementations must tolerate `negotiate` futures being dropped at any
/// await point; the facade follows up with either `cancel_negotiation` or
/// `release`.
#[async_trait]
pub trait TransportEngine: Send {
    /// Produces the description the remote peer needs to answer.
    async fn create_offer(&mut self) -> Result<LocalDescription, EngineError>;

    /// Applies the remote description and resolves once the transport path
    /// is up.
    async fn negotiate(&mut self, remote: &RemoteDescription) -> Result<(), EngineError>;

    /// Abandons an in-flight negotiation after a timeout. The engine must stay
    /// usable for another `negotiate` call.
    fn cancel_negotiation(&mut self);

    /// Delivers a control message to the remote peer.
    async fn send_control(&mut self, message: ControlMessage) -> Result<(), EngineError>;

    /// Hands out the event stream. Returns `None` on every call after the
    /// first.
    fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<EngineEvent>>;

    fn stats(&self) -> TransportStats;

    /// Tears the engine down. Idempotent.
    fn release(&mut self);

    fn is_released(&self) -> bool;
}
