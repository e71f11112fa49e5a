//! Real-time session facade.
//!
//! `rover_call` exposes a small, stable API for establishing, maintaining and
//! tearing down peer connections. All media and transport work is delegated
//! to an engine backend injected at construction time; the facade only owns
//! the session lifecycle.
//!
//! ```no_run
//! use rover_call::{engine::LoopbackProvider, SessionConfig, SessionContext};
//!
//! # async fn demo() -> rover_call::Result<()> {
//! let provider = LoopbackProvider::new();
//! let ctx = SessionContext::new(provider);
//!
//! let session = ctx.open(SessionConfig::with_servers(["stun:example"])).await?;
//! let answer = rover_call::engine::loopback::answer_for(session.local_description())?;
//! ctx.negotiate(&session, answer).await?;
//! ctx.close(&session).await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod facade;
pub mod model;
pub mod signaling;
pub mod util;

pub use config::{IceServer, MediaConstraints, SessionConfig};
pub use error::{ErrorKind, FacadeError, Result};
pub use facade::{Session, SessionContext};
pub use model::description::{LocalDescription, RemoteDescription};
pub use model::session::{MediaAttributes, SessionId, SessionInfo, SessionState};

/// Version of this crate.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
