//! Room-server control plane
//!
//! The worker talks to the room server over a single WebSocket: it
//! registers its identity, receives job assignments and room events, and
//! issues SIP operations (create participant, transfer, delete room) as
//! correlated request/response pairs. A stub implementation backs the
//! integration tests.

pub mod client;
pub mod dialer;
pub mod protocol;
pub mod stub;

pub use client::{ControlEvent, RoomControl, WsControlClient};
pub use dialer::{DialError, Dialer};
pub use protocol::{
    ClientMessage, CreateSipParticipant, JobPayload, JobState, ServerMessage, SipCommand,
    SipResult,
};
pub use stub::{StatusReport, StubControlPlane};

use thiserror::Error;

/// Control plane errors
#[derive(Error, Debug, Clone)]
pub enum ControlError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("request timed out")]
    Timeout,

    #[error("control channel closed")]
    Closed,
}

impl From<ControlError> for callagent_core::Error {
    fn from(err: ControlError) -> Self {
        callagent_core::Error::Control(err.to_string())
    }
}
