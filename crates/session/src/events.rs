//! Session event queue types
//!
//! Everything the orchestrator reacts to arrives as a `SessionEvent` on a
//! single queue: turn boundaries, provider stream events tagged with their
//! generation, and external control signals.

use callagent_llm::LlmEvent;
use callagent_pipeline::TurnEvent;

/// Events consumed by the session orchestrator
#[derive(Debug)]
pub enum SessionEvent {
    /// Turn detector output
    Turn(TurnEvent),
    /// LLM stream event, tagged with the generation that produced it
    Llm { generation: u64, event: LlmEvent },
    /// First synthesized audio reached the sink
    TtsStarted { speech_id: u64 },
    /// A synthesized chunk was forwarded to the sink
    TtsProgress { speech_id: u64, text: String },
    /// Synthesis and playout finished (or was cancelled)
    TtsFinished { speech_id: u64, completed: bool },
    /// The remote participant left the room
    ParticipantLeft,
    /// A tool or the worker requested hangup
    HangupRequested { after_speech: bool },
    /// Unrecoverable failure reported by a producer task
    FatalError { message: String },
}
