//! Settings and agent configuration
//!
//! Configuration is layered: built-in defaults, then optional config files,
//! then `CALLAGENT__`-prefixed environment variables, then the well-known
//! environment names recognized by the worker (`LIVEKIT_URL`,
//! `SIP_OUTBOUND_TRUNK_ID`, `STT_MODEL`, ...).

pub mod agent;
pub mod settings;

pub use agent::{AgentConfig, LlmSpec, SttSpec, TtsSpec, VadSpec, VoiceAdaptationSpec};
pub use settings::{
    load_settings, ControlConfig, ObservabilityConfig, SessionTimeouts, Settings, WorkerConfig,
};

use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("configuration source error: {0}")]
    Source(#[from] config::ConfigError),

    #[error("missing required setting '{0}'")]
    Missing(&'static str),

    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}
