//! Provider port interfaces
//!
//! Each provider client implements a narrow streaming interface built from
//! bounded channels. Streams are owned by exactly one session; `close`
//! cancels the provider task behind a stream, and channel closure stops it
//! as well once the session side is gone.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use callagent_core::AudioFrame;
use callagent_config::{SttSpec, TtsSpec, VadSpec};

use crate::PipelineError;

/// Default capacity for audio frame channels
pub const AUDIO_CHANNEL_CAPACITY: usize = 32;
/// Default capacity for provider event channels
pub const EVENT_CHANNEL_CAPACITY: usize = 32;
/// Capacity for the text channel feeding TTS. Small on purpose: a full
/// channel blocks the LLM token pump instead of buffering unbounded text.
pub const TTS_TEXT_CAPACITY: usize = 8;

/// STT stream events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SttEvent {
    /// Interim transcript, may be revised
    Partial { text: String },
    /// Finalized transcript segment
    Final { text: String },
}

/// VAD stream events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadEvent {
    VoiceStarted { at_ms: u64 },
    VoiceStopped { at_ms: u64 },
}

/// Session-side handle of an open STT stream
pub struct SttStream {
    /// Audio input to the recognizer
    pub frames: mpsc::Sender<AudioFrame>,
    /// Transcription events
    pub events: mpsc::Receiver<SttEvent>,
    /// Cancels the provider task behind the stream
    pub cancel: CancellationToken,
}

/// Provider-side handle of an STT stream
pub struct SttStreamEnd {
    pub frames: mpsc::Receiver<AudioFrame>,
    pub events: mpsc::Sender<SttEvent>,
    pub cancel: CancellationToken,
}

impl SttStream {
    /// Create a connected stream pair
    pub fn pair() -> (SttStream, SttStreamEnd) {
        let (frames_tx, frames_rx) = mpsc::channel(AUDIO_CHANNEL_CAPACITY);
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        (
            SttStream {
                frames: frames_tx,
                events: events_rx,
                cancel: cancel.clone(),
            },
            SttStreamEnd {
                frames: frames_rx,
                events: events_tx,
                cancel,
            },
        )
    }

    /// Close the stream and cancel the provider task
    pub fn close(&self) {
        self.cancel.cancel();
    }
}


/// Session-side handle of an open VAD stream
pub struct VadStream {
    pub frames: mpsc::Sender<AudioFrame>,
    pub events: mpsc::Receiver<VadEvent>,
    /// Cancels the provider task behind the stream
    pub cancel: CancellationToken,
}

/// Provider-side handle of a VAD stream
pub struct VadStreamEnd {
    pub frames: mpsc::Receiver<AudioFrame>,
    pub events: mpsc::Sender<VadEvent>,
    pub cancel: CancellationToken,
}

impl VadStream {
    /// Create a connected stream pair
    pub fn pair() -> (VadStream, VadStreamEnd) {
        let (frames_tx, frames_rx) = mpsc::channel(AUDIO_CHANNEL_CAPACITY);
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        (
            VadStream {
                frames: frames_tx,
                events: events_rx,
                cancel: cancel.clone(),
            },
            VadStreamEnd {
                frames: frames_rx,
                events: events_tx,
                cancel,
            },
        )
    }

    /// Close the stream and cancel the provider task
    pub fn close(&self) {
        self.cancel.cancel();
    }
}


/// One emotion dimension with intensity
#[derive(Debug, Clone, PartialEq)]
pub struct Emotion {
    pub kind: String,
    pub intensity: f32,
}

impl Emotion {
    pub fn new(kind: impl Into<String>, intensity: f32) -> Self {
        Self {
            kind: kind.into(),
            intensity: intensity.clamp(0.0, 1.0),
        }
    }
}

/// Synthesis parameters produced by the voice adaptation engine
#[derive(Debug, Clone, PartialEq)]
pub struct TtsParams {
    /// Relative speaking rate, 1.0 is baseline
    pub speed: f32,
    /// Emotion vector
    pub emotions: Vec<Emotion>,
    /// Silence inserted before the first byte of speech
    pub pre_speech_delay_ms: u64,
}

impl Default for TtsParams {
    fn default() -> Self {
        Self {
            speed: 1.0,
            emotions: Vec::new(),
            pre_speech_delay_ms: 20,
        }
    }
}

/// A synthesized audio chunk covering a span of the input text
#[derive(Debug, Clone)]
pub struct TtsChunk {
    /// Synthesized audio
    pub frame: AudioFrame,
    /// The text span this chunk covers
    pub text: String,
}

/// Session-side handle of an open TTS stream
///
/// Text chunks are fed incrementally; dropping the text sender finalizes
/// the input. The audio channel closing signals playout-complete.
pub struct TtsStream {
    /// Incremental text input; drop to finalize
    pub text: Option<mpsc::Sender<String>>,
    /// Synthesized audio out
    pub audio: mpsc::Receiver<TtsChunk>,
    /// Cancels the provider task behind the stream
    pub cancel: CancellationToken,
}

/// Provider-side handle of a TTS stream
pub struct TtsStreamEnd {
    pub text: mpsc::Receiver<String>,
    pub audio: mpsc::Sender<TtsChunk>,
    pub cancel: CancellationToken,
}

impl TtsStream {
    /// Create a connected stream pair
    pub fn pair() -> (TtsStream, TtsStreamEnd) {
        let (text_tx, text_rx) = mpsc::channel(TTS_TEXT_CAPACITY);
        let (audio_tx, audio_rx) = mpsc::channel(AUDIO_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        (
            TtsStream {
                text: Some(text_tx),
                audio: audio_rx,
                cancel: cancel.clone(),
            },
            TtsStreamEnd {
                text: text_rx,
                audio: audio_tx,
                cancel,
            },
        )
    }

    /// Finalize the text input; synthesis completes whatever is queued
    pub fn finish_text(&mut self) {
        self.text = None;
    }

    /// Abort synthesis immediately
    pub fn close(&self) {
        self.cancel.cancel();
    }
}


/// Streaming speech-to-text provider
#[async_trait]
pub trait SttClient: Send + Sync {
    /// Open a recognition stream
    async fn open(&self, spec: &SttSpec) -> Result<SttStream, PipelineError>;
}

/// Streaming voice-activity-detection provider
#[async_trait]
pub trait VadClient: Send + Sync {
    /// Open a detection stream
    async fn open(&self, spec: &VadSpec) -> Result<VadStream, PipelineError>;
}

/// Streaming text-to-speech provider
#[async_trait]
pub trait TtsClient: Send + Sync {
    /// Start a synthesis stream with the given delivery parameters
    async fn synthesize(&self, spec: &TtsSpec, params: &TtsParams)
        -> Result<TtsStream, PipelineError>;
}

/// Outbound audio playout port
#[async_trait]
pub trait AudioSink: Send + Sync {
    /// Queue a frame for playout
    async fn send(&self, frame: AudioFrame) -> Result<(), PipelineError>;

    /// Drop any queued playout immediately (barge-in)
    async fn clear(&self);
}
