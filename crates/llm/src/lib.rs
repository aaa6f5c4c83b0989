//! LLM streaming interfaces
//!
//! Defines the event model streamed back from a completion, the client
//! trait providers implement, the sentence buffer that groups tokens into
//! speakable chunks, and a scripted client for tests.

pub mod client;
pub mod scripted;
pub mod streaming;

pub use client::{FinishReason, LlmClient, LlmEvent};
pub use scripted::{ScriptedLlm, ScriptedStep};
pub use streaming::SentenceBuffer;

use thiserror::Error;

/// LLM errors
#[derive(Error, Debug, Clone)]
pub enum LlmError {
    #[error("provider error: {0}")]
    Provider(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("stream closed unexpectedly")]
    StreamClosed,
}

impl From<LlmError> for callagent_core::Error {
    fn from(err: LlmError) -> Self {
        callagent_core::Error::Llm(err.to_string())
    }
}
