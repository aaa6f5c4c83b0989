//! Agent configuration
//!
//! An `AgentConfig` describes one call's speech stack: instructions, the
//! provider specs for STT/LLM/TTS/VAD, voice adaptation, and the tool set.
//! Worker-level defaults are specialized per job from metadata.

use callagent_core::JobMetadata;
use serde::{Deserialize, Serialize};

/// Speech-to-text tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SttSpec {
    /// Provider identifier (e.g. "deepgram", "simulated")
    #[serde(default = "default_stt_provider")]
    pub provider: String,

    /// Model name
    #[serde(default = "default_stt_model")]
    pub model: String,

    /// Recognition language (ISO 639-1)
    #[serde(default = "default_language")]
    pub language: String,

    /// Endpointing silence window in milliseconds
    #[serde(default = "default_endpointing_ms")]
    pub endpointing_ms: u64,
}

fn default_stt_provider() -> String {
    "simulated".to_string()
}
fn default_stt_model() -> String {
    "nova-2".to_string()
}
fn default_language() -> String {
    "en".to_string()
}
fn default_endpointing_ms() -> u64 {
    200
}

impl Default for SttSpec {
    fn default() -> Self {
        Self {
            provider: default_stt_provider(),
            model: default_stt_model(),
            language: default_language(),
            endpointing_ms: default_endpointing_ms(),
        }
    }
}

/// Large-language-model tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmSpec {
    /// Provider identifier
    #[serde(default = "default_llm_provider")]
    pub provider: String,

    /// Model name
    #[serde(default = "default_llm_model")]
    pub model: String,

    /// Sampling temperature
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Hard timeout for a single completion in milliseconds
    #[serde(default = "default_llm_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_llm_provider() -> String {
    "simulated".to_string()
}
fn default_llm_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_llm_timeout_ms() -> u64 {
    30_000
}

impl Default for LlmSpec {
    fn default() -> Self {
        Self {
            provider: default_llm_provider(),
            model: default_llm_model(),
            temperature: default_temperature(),
            timeout_ms: default_llm_timeout_ms(),
        }
    }
}

/// Text-to-speech tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsSpec {
    /// Provider identifier
    #[serde(default = "default_tts_provider")]
    pub provider: String,

    /// Model name
    #[serde(default = "default_tts_model")]
    pub model: String,

    /// Voice id
    #[serde(default)]
    pub voice_id: Option<String>,

    /// Output sample rate in Hz
    #[serde(default = "default_tts_sample_rate")]
    pub sample_rate: u32,

    /// Timeout for the first synthesized byte in milliseconds
    #[serde(default = "default_tts_timeout_ms")]
    pub first_byte_timeout_ms: u64,
}

fn default_tts_provider() -> String {
    "simulated".to_string()
}
fn default_tts_model() -> String {
    "sonic-2".to_string()
}
fn default_tts_sample_rate() -> u32 {
    16_000
}
fn default_tts_timeout_ms() -> u64 {
    5_000
}

impl Default for TtsSpec {
    fn default() -> Self {
        Self {
            provider: default_tts_provider(),
            model: default_tts_model(),
            voice_id: None,
            sample_rate: default_tts_sample_rate(),
            first_byte_timeout_ms: default_tts_timeout_ms(),
        }
    }
}

/// Voice activity detection tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VadSpec {
    /// Provider identifier
    #[serde(default = "default_vad_provider")]
    pub provider: String,

    /// Energy floor for the simulated detector (dBFS)
    #[serde(default = "default_energy_floor")]
    pub energy_floor_db: f32,

    /// Minimum voiced duration before reporting speech (ms)
    #[serde(default = "default_min_speech_ms")]
    pub min_speech_ms: u64,
}

fn default_vad_provider() -> String {
    "simulated".to_string()
}
fn default_energy_floor() -> f32 {
    -50.0
}
fn default_min_speech_ms() -> u64 {
    60
}

impl Default for VadSpec {
    fn default() -> Self {
        Self {
            provider: default_vad_provider(),
            energy_floor_db: default_energy_floor(),
            min_speech_ms: default_min_speech_ms(),
        }
    }
}

/// Voice adaptation tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceAdaptationSpec {
    /// Master switch
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Minimum seconds between adaptation updates
    #[serde(default = "default_rate_limit_seconds")]
    pub rate_limit_seconds: f64,

    /// Bounded history length for mirroring
    #[serde(default = "default_memory_limit")]
    pub memory_limit: usize,
}

fn default_true() -> bool {
    true
}
fn default_rate_limit_seconds() -> f64 {
    2.0
}
fn default_memory_limit() -> usize {
    20
}

impl Default for VoiceAdaptationSpec {
    fn default() -> Self {
        Self {
            enabled: true,
            rate_limit_seconds: default_rate_limit_seconds(),
            memory_limit: default_memory_limit(),
        }
    }
}

/// Full per-call agent configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// System prompt. `{customer_name}` is substituted when metadata
    /// carries a customer name.
    #[serde(default = "default_instructions")]
    pub instructions: String,

    /// Greeting spoken when the remote party answers; empty disables it
    #[serde(default)]
    pub greeting: Option<String>,

    /// LLM spec
    #[serde(default)]
    pub llm: LlmSpec,

    /// STT spec
    #[serde(default)]
    pub stt: SttSpec,

    /// TTS spec
    #[serde(default)]
    pub tts: TtsSpec,

    /// VAD spec
    #[serde(default)]
    pub vad: VadSpec,

    /// Voice adaptation spec
    #[serde(default)]
    pub voice_adaptation: VoiceAdaptationSpec,

    /// Names of tools enabled beyond the built-in call tools
    #[serde(default)]
    pub tools: Vec<String>,
}

fn default_instructions() -> String {
    "You are a friendly phone assistant. Keep responses short and \
     conversational, one or two sentences."
        .to_string()
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            instructions: default_instructions(),
            greeting: None,
            llm: LlmSpec::default(),
            stt: SttSpec::default(),
            tts: TtsSpec::default(),
            vad: VadSpec::default(),
            voice_adaptation: VoiceAdaptationSpec::default(),
            tools: Vec::new(),
        }
    }
}

impl AgentConfig {
    /// Specialize the worker defaults for one job
    ///
    /// Metadata may override the system prompt (`system_prompt`) and the
    /// greeting (`initial_greeting`). A `{customer_name}` placeholder in
    /// the instructions is substituted when a name is present.
    pub fn for_job(&self, metadata: &JobMetadata) -> Self {
        let mut config = self.clone();

        if let Some(prompt) = metadata.custom_str("system_prompt") {
            config.instructions = prompt.to_string();
        }
        if let Some(greeting) = metadata.custom_str("initial_greeting") {
            config.greeting = Some(greeting.to_string());
        }
        if let Some(name) = &metadata.customer_name {
            config.instructions = config.instructions.replace("{customer_name}", name);
            if let Some(greeting) = config.greeting.take() {
                config.greeting = Some(greeting.replace("{customer_name}", name));
            }
        }

        config
    }
}
