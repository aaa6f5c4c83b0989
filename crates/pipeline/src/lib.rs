//! Streaming port adapters and turn detection
//!
//! This crate provides the seams between the session and the speech
//! providers:
//! - Narrow streaming interfaces for STT, VAD, and TTS
//! - An audio sink port for outbound playout
//! - The turn detector fusing VAD activity with STT endpointing
//! - Simulated providers for tests and credential-free runs

pub mod ports;
pub mod simulated;
pub mod turn_detector;

pub use ports::{
    AudioSink, Emotion, SttClient, SttEvent, SttStream, SttStreamEnd, TtsChunk, TtsClient,
    TtsParams, TtsStream, TtsStreamEnd, VadClient, VadEvent, VadStream, VadStreamEnd,
};
pub use simulated::{
    CapturingSink, NullSink, SimulatedSttClient, SimulatedTtsClient, SimulatedVadClient,
};
pub use turn_detector::{spawn_turn_detector, TurnDetector, TurnDetectorConfig, TurnEvent};

use thiserror::Error;

/// Pipeline errors
#[derive(Error, Debug, Clone)]
pub enum PipelineError {
    #[error("STT error: {0}")]
    Stt(String),

    #[error("VAD error: {0}")]
    Vad(String),

    #[error("TTS error: {0}")]
    Tts(String),

    #[error("audio sink error: {0}")]
    Sink(String),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("channel closed")]
    ChannelClosed,

    #[error("timeout")]
    Timeout,
}

impl From<PipelineError> for callagent_core::Error {
    fn from(err: PipelineError) -> Self {
        callagent_core::Error::Pipeline(err.to_string())
    }
}
