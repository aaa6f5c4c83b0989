//! Shared error type

use thiserror::Error;

use crate::chat::ChatError;
use crate::job::JobError;

/// Result alias for core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error for the runtime
#[derive(Error, Debug)]
pub enum Error {
    #[error("chat context error: {0}")]
    Chat(#[from] ChatError),

    #[error("job error: {0}")]
    Job(#[from] JobError),

    #[error("pipeline error: {0}")]
    Pipeline(String),

    #[error("llm error: {0}")]
    Llm(String),

    #[error("tool error: {0}")]
    Tool(String),

    #[error("session error: {0}")]
    Session(String),

    #[error("control plane error: {0}")]
    Control(String),
}
