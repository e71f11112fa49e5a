//! Data models for sessions
//!
//! This module contains the data structures shared between the facade and the
//! engine backends: session identity and lifecycle, the opaque descriptions
//! exchanged with the remote peer, and the control frames sent over the wire.

pub mod control;
pub mod description;
pub mod session;
