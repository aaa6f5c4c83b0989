//! Audio frame types shared between the room transport and the pipeline.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Supported sample rates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SampleRate {
    Hz8000,
    Hz16000,
    Hz24000,
    Hz48000,
}

impl SampleRate {
    /// Sample rate in Hz
    pub fn as_hz(self) -> u32 {
        match self {
            SampleRate::Hz8000 => 8_000,
            SampleRate::Hz16000 => 16_000,
            SampleRate::Hz24000 => 24_000,
            SampleRate::Hz48000 => 48_000,
        }
    }
}

/// Channel layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Channels {
    Mono,
    Stereo,
}

impl Channels {
    pub fn count(self) -> usize {
        match self {
            Channels::Mono => 1,
            Channels::Stereo => 2,
        }
    }
}

/// A single PCM audio frame
///
/// Samples are normalized f32 in [-1.0, 1.0]. Frames are cheap to clone;
/// the sample buffer is shared.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// PCM samples
    pub samples: Arc<[f32]>,
    /// Sample rate
    pub sample_rate: SampleRate,
    /// Channel layout
    pub channels: Channels,
    /// Capture timestamp in milliseconds (stream-relative)
    pub timestamp_ms: u64,
}

impl AudioFrame {
    /// Create a new audio frame
    pub fn new(
        samples: Vec<f32>,
        sample_rate: SampleRate,
        channels: Channels,
        timestamp_ms: u64,
    ) -> Self {
        Self {
            samples: samples.into(),
            sample_rate,
            channels,
            timestamp_ms,
        }
    }

    /// Frame duration in milliseconds
    pub fn duration_ms(&self) -> u64 {
        let per_channel = self.samples.len() / self.channels.count();
        (per_channel as u64 * 1000) / self.sample_rate.as_hz() as u64
    }

    /// RMS energy in dBFS
    pub fn energy_db(&self) -> f32 {
        if self.samples.is_empty() {
            return f32::NEG_INFINITY;
        }
        let sum_sq: f32 = self.samples.iter().map(|s| s * s).sum();
        let rms = (sum_sq / self.samples.len() as f32).sqrt();
        if rms <= f32::EPSILON {
            f32::NEG_INFINITY
        } else {
            20.0 * rms.log10()
        }
    }

    /// Check whether the frame is below the given energy floor
    pub fn is_silence(&self, floor_db: f32) -> bool {
        self.energy_db() < floor_db
    }
}
