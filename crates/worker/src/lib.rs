//! Worker runtime
//!
//! The worker registers with the room-server control plane, accepts job
//! assignments, places the outbound call, and runs one isolated session
//! per job.

pub mod actions;
pub mod dispatcher;

pub use actions::WorkerCallActions;
pub use dispatcher::{Dispatcher, ProviderSet};

use thiserror::Error;

/// Worker-level errors
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("configuration error: {0}")]
    Config(#[from] callagent_config::ConfigError),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("control plane error: {0}")]
    Control(#[from] callagent_control::ControlError),

    #[error("dispatcher already running")]
    AlreadyRunning,
}
