//! Simulated providers
//!
//! Deterministic in-process implementations of the provider ports. They
//! keep the runtime exercisable end-to-end without cloud credentials and
//! are the doubles the integration tests script against.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::{sleep, Duration, Instant};

use callagent_core::{AudioFrame, Channels, SampleRate};
use callagent_config::{SttSpec, TtsSpec, VadSpec};

use crate::ports::{
    AudioSink, SttClient, SttEvent, SttStream, TtsChunk, TtsClient, TtsParams, TtsStream,
    VadClient, VadEvent, VadStream,
};
use crate::PipelineError;

/// Energy-gated simulated speech recognizer
///
/// Scripted utterances pop in order: once enough voiced audio has been
/// seen, the next utterance streams out as a halfway partial followed by a
/// final when the audio goes quiet.
pub struct SimulatedSttClient {
    utterances: Arc<Mutex<VecDeque<String>>>,
    /// Voiced milliseconds required before an utterance is recognized
    min_voiced_ms: u64,
    energy_floor_db: f32,
}

impl SimulatedSttClient {
    pub fn new(utterances: Vec<String>) -> Self {
        Self {
            utterances: Arc::new(Mutex::new(utterances.into())),
            min_voiced_ms: 200,
            energy_floor_db: -50.0,
        }
    }

    /// Queue another utterance mid-call
    pub fn push_utterance(&self, text: impl Into<String>) {
        self.utterances.lock().push_back(text.into());
    }
}

#[async_trait]
impl SttClient for SimulatedSttClient {
    async fn open(&self, _spec: &SttSpec) -> Result<SttStream, PipelineError> {
        let (stream, mut end) = SttStream::pair();
        let utterances = Arc::clone(&self.utterances);
        let min_voiced_ms = self.min_voiced_ms;
        let floor = self.energy_floor_db;

        tokio::spawn(async move {
            let mut voiced_ms: u64 = 0;
            let mut partial_sent = false;

            loop {
                let frame = tokio::select! {
                    _ = end.cancel.cancelled() => break,
                    frame = end.frames.recv() => match frame {
                        Some(f) => f,
                        None => break,
                    },
                };

                if frame.is_silence(floor) {
                    if voiced_ms >= min_voiced_ms {
                        let text = { utterances.lock().pop_front() };
                        if let Some(text) = text {
                            if end.events.send(SttEvent::Final { text }).await.is_err() {
                                break;
                            }
                        }
                    }
                    voiced_ms = 0;
                    partial_sent = false;
                    continue;
                }

                voiced_ms += frame.duration_ms();
                if voiced_ms >= min_voiced_ms / 2 && !partial_sent {
                    let partial = { utterances.lock().front().cloned() };
                    if let Some(text) = partial {
                        partial_sent = true;
                        let half: String = {
                            let words: Vec<&str> = text.split_whitespace().collect();
                            words[..words.len().div_ceil(2)].join(" ")
                        };
                        if end.events.send(SttEvent::Partial { text: half }).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Ok(stream)
    }
}

/// Energy-threshold simulated voice activity detector
pub struct SimulatedVadClient;

#[async_trait]
impl VadClient for SimulatedVadClient {
    async fn open(&self, spec: &VadSpec) -> Result<VadStream, PipelineError> {
        let (stream, mut end) = VadStream::pair();
        let floor = spec.energy_floor_db;
        let min_speech_ms = spec.min_speech_ms;

        tokio::spawn(async move {
            let mut voiced_ms: u64 = 0;
            let mut reporting_voice = false;

            loop {
                let frame = tokio::select! {
                    _ = end.cancel.cancelled() => break,
                    frame = end.frames.recv() => match frame {
                        Some(f) => f,
                        None => break,
                    },
                };

                if frame.is_silence(floor) {
                    voiced_ms = 0;
                    if reporting_voice {
                        reporting_voice = false;
                        let ev = VadEvent::VoiceStopped { at_ms: frame.timestamp_ms };
                        if end.events.send(ev).await.is_err() {
                            break;
                        }
                    }
                } else {
                    voiced_ms += frame.duration_ms();
                    if !reporting_voice && voiced_ms >= min_speech_ms {
                        reporting_voice = true;
                        let ev = VadEvent::VoiceStarted { at_ms: frame.timestamp_ms };
                        if end.events.send(ev).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Ok(stream)
    }
}

/// Pacing simulated synthesizer
///
/// Emits one silent chunk per text chunk, sized to the text length at
/// `chars_per_second`, honoring the pre-speech delay and speed parameter.
/// The first chunk is emitted at chunk start; playout then paces out the
/// chunk duration before the next chunk begins.
pub struct SimulatedTtsClient {
    chars_per_second: f32,
}

impl SimulatedTtsClient {
    pub fn new() -> Self {
        Self {
            chars_per_second: 15.0,
        }
    }

    /// Override the speaking pace (useful in tests)
    pub fn with_chars_per_second(mut self, cps: f32) -> Self {
        self.chars_per_second = cps;
        self
    }
}

impl Default for SimulatedTtsClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TtsClient for SimulatedTtsClient {
    async fn synthesize(
        &self,
        spec: &TtsSpec,
        params: &TtsParams,
    ) -> Result<TtsStream, PipelineError> {
        let (stream, mut end) = TtsStream::pair();
        let sample_rate = spec.sample_rate;
        let cps = self.chars_per_second * params.speed.max(0.1);
        let pre_speech_delay = Duration::from_millis(params.pre_speech_delay_ms);

        tokio::spawn(async move {
            let mut first = true;
            loop {
                let text = tokio::select! {
                    _ = end.cancel.cancelled() => break,
                    text = end.text.recv() => match text {
                        Some(t) => t,
                        None => break,
                    },
                };

                if first {
                    first = false;
                    tokio::select! {
                        _ = end.cancel.cancelled() => break,
                        _ = sleep(pre_speech_delay) => {}
                    }
                }

                let duration_ms = ((text.chars().count() as f32 / cps) * 1000.0) as u64;
                let samples = vec![0.0f32; (sample_rate as u64 * duration_ms / 1000) as usize];
                let rate = match sample_rate {
                    8_000 => SampleRate::Hz8000,
                    24_000 => SampleRate::Hz24000,
                    48_000 => SampleRate::Hz48000,
                    _ => SampleRate::Hz16000,
                };
                let frame = AudioFrame::new(samples, rate, Channels::Mono, 0);
                let chunk = TtsChunk { frame, text };

                if end.audio.send(chunk).await.is_err() {
                    break;
                }

                // Pace out playout before synthesizing the next chunk.
                tokio::select! {
                    _ = end.cancel.cancelled() => break,
                    _ = sleep(Duration::from_millis(duration_ms)) => {}
                }
            }
        });

        Ok(stream)
    }
}

/// Sink that discards playout
pub struct NullSink;

#[async_trait]
impl AudioSink for NullSink {
    async fn send(&self, _frame: AudioFrame) -> Result<(), PipelineError> {
        Ok(())
    }

    async fn clear(&self) {}
}

/// Sink that records every frame with its arrival time
///
/// Tests assert on playout timing (e.g. barge-in cut-off) against the
/// recorded instants.
#[derive(Clone)]
pub struct CapturingSink {
    frames: Arc<Mutex<Vec<(Instant, AudioFrame)>>>,
    cleared_at: Arc<Mutex<Vec<Instant>>>,
}

impl CapturingSink {
    pub fn new() -> Self {
        Self {
            frames: Arc::new(Mutex::new(Vec::new())),
            cleared_at: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Frames captured so far
    pub fn frames(&self) -> Vec<(Instant, AudioFrame)> {
        self.frames.lock().clone()
    }

    /// Times at which the queue was cleared
    pub fn clears(&self) -> Vec<Instant> {
        self.cleared_at.lock().clone()
    }

    /// Instant of the last frame sent, if any
    pub fn last_frame_at(&self) -> Option<Instant> {
        self.frames.lock().last().map(|(at, _)| *at)
    }
}

impl Default for CapturingSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AudioSink for CapturingSink {
    async fn send(&self, frame: AudioFrame) -> Result<(), PipelineError> {
        self.frames.lock().push((Instant::now(), frame));
        Ok(())
    }

    async fn clear(&self) {
        self.cleared_at.lock().push(Instant::now());
    }
}
