//! Per-call conversation session
//!
//! The session is the per-call orchestrator: one task owns the state
//! machine and consumes a single event queue fed by the provider stream
//! tasks. It drives listening, thinking, speaking, and tool execution,
//! aggregates per-turn latency metrics, and coordinates teardown.

pub mod adaptation;
pub mod events;
pub mod metrics;
pub mod session;
pub mod state;

pub use adaptation::{AdaptationDecision, MessageAnalysis, VoiceAdaptationEngine};
pub use events::SessionEvent;
pub use metrics::MetricsSink;
pub use session::{Session, SessionConfig, SessionDeps, SessionHandle};
pub use state::SessionState;

use thiserror::Error;

/// Session errors
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("chat error: {0}")]
    Chat(#[from] callagent_core::ChatError),

    #[error("pipeline error: {0}")]
    Pipeline(#[from] callagent_pipeline::PipelineError),

    #[error("llm error: {0}")]
    Llm(#[from] callagent_llm::LlmError),

    #[error("invalid state transition: {from:?} -> {to:?}")]
    InvalidTransition {
        from: state::SessionState,
        to: state::SessionState,
    },
}
