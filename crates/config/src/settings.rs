//! Worker settings
//!
//! Loaded once in `main` and passed down explicitly; nothing reads the
//! environment after startup.

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::{AgentConfig, ConfigError};

/// Control-plane connection settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControlConfig {
    /// Room-server URL (ws:// or wss://)
    #[serde(default)]
    pub url: String,

    /// API key
    #[serde(default)]
    pub api_key: String,

    /// API secret
    #[serde(default)]
    pub api_secret: String,

    /// Outbound SIP trunk id
    #[serde(default)]
    pub sip_trunk_id: String,
}

/// Worker identity and capacity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Worker name registered with the control plane
    #[serde(default = "default_worker_name")]
    pub name: String,

    /// Maximum concurrent sessions
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,

    /// Grace period for session drain on shutdown (ms)
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,

    /// Hard cap on call duration (ms); None disables the cap
    #[serde(default = "default_call_time_limit")]
    pub call_time_limit_ms: Option<u64>,
}

fn default_worker_name() -> String {
    "outbound-caller".to_string()
}
fn default_max_sessions() -> usize {
    32
}
fn default_shutdown_grace_ms() -> u64 {
    5_000
}
fn default_call_time_limit() -> Option<u64> {
    Some(30 * 60 * 1000)
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: default_worker_name(),
            max_sessions: default_max_sessions(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            call_time_limit_ms: default_call_time_limit(),
        }
    }
}

/// Session-level timeouts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionTimeouts {
    /// Silence hangover before declaring turn end (ms)
    #[serde(default = "default_endpointing_ms")]
    pub endpointing_silence_ms: u64,

    /// Hold window for an STT final that arrives mid-voice (ms)
    #[serde(default = "default_final_debounce_ms")]
    pub final_debounce_ms: u64,

    /// Grace given to in-flight tool calls on cancellation (ms)
    #[serde(default = "default_tool_grace_ms")]
    pub tool_shutdown_grace_ms: u64,
}

fn default_endpointing_ms() -> u64 {
    200
}
fn default_final_debounce_ms() -> u64 {
    200
}
fn default_tool_grace_ms() -> u64 {
    2_000
}

impl Default for SessionTimeouts {
    fn default() -> Self {
        Self {
            endpointing_silence_ms: default_endpointing_ms(),
            final_debounce_ms: default_final_debounce_ms(),
            tool_shutdown_grace_ms: default_tool_grace_ms(),
        }
    }
}

/// Observability settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Emit JSON logs
    #[serde(default)]
    pub log_json: bool,

    /// OTLP endpoint for trace export
    #[serde(default)]
    pub otlp_endpoint: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_json: false,
            otlp_endpoint: None,
        }
    }
}

/// Top-level settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Control-plane connection
    #[serde(default)]
    pub control: ControlConfig,

    /// Worker identity and capacity
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Default agent configuration (per-job overrides apply on top)
    #[serde(default)]
    pub agent: AgentConfig,

    /// Session timeouts
    #[serde(default)]
    pub session: SessionTimeouts,

    /// Observability
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Settings {
    /// Validate required connection settings
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.control.url.is_empty() {
            return Err(ConfigError::Missing("control.url (LIVEKIT_URL)"));
        }
        if self.control.api_key.is_empty() {
            return Err(ConfigError::Missing("control.api_key (LIVEKIT_API_KEY)"));
        }
        if self.control.api_secret.is_empty() {
            return Err(ConfigError::Missing(
                "control.api_secret (LIVEKIT_API_SECRET)",
            ));
        }
        if self.control.sip_trunk_id.is_empty() {
            return Err(ConfigError::Missing(
                "control.sip_trunk_id (SIP_OUTBOUND_TRUNK_ID)",
            ));
        }
        if self.session.endpointing_silence_ms > 2_000 {
            return Err(ConfigError::InvalidValue {
                field: "session.endpointing_silence_ms".to_string(),
                message: "endpointing silence above 2000ms makes turns unusable".to_string(),
            });
        }
        Ok(())
    }

    /// Apply the well-known environment variable names
    ///
    /// These are the names operators already export for LiveKit-style
    /// deployments; they beat anything from files or prefixed variables.
    fn apply_well_known_env(&mut self) {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());

        if let Some(v) = var("LIVEKIT_URL") {
            self.control.url = v;
        }
        if let Some(v) = var("LIVEKIT_API_KEY") {
            self.control.api_key = v;
        }
        if let Some(v) = var("LIVEKIT_API_SECRET") {
            self.control.api_secret = v;
        }
        if let Some(v) = var("SIP_OUTBOUND_TRUNK_ID") {
            self.control.sip_trunk_id = v;
        }

        if let Some(v) = var("VOICE_ADAPTATION_ENABLED") {
            self.agent.voice_adaptation.enabled = v.eq_ignore_ascii_case("true");
        }
        if let Some(v) = var("VOICE_ADAPTATION_RATE_LIMIT_S") {
            if let Ok(parsed) = v.parse() {
                self.agent.voice_adaptation.rate_limit_seconds = parsed;
            }
        }
        if let Some(v) = var("VOICE_ADAPTATION_MEMORY_LIMIT") {
            if let Ok(parsed) = v.parse() {
                self.agent.voice_adaptation.memory_limit = parsed;
            }
        }

        if let Some(v) = var("STT_MODEL") {
            self.agent.stt.model = v;
        }
        if let Some(v) = var("STT_LANGUAGE") {
            self.agent.stt.language = v;
        }
        if let Some(v) = var("STT_ENDPOINTING_MS") {
            if let Ok(parsed) = v.parse() {
                self.agent.stt.endpointing_ms = parsed;
                self.session.endpointing_silence_ms = parsed;
            }
        }

        if let Some(v) = var("LLM_MODEL") {
            self.agent.llm.model = v;
        }
        if let Some(v) = var("LLM_TEMPERATURE") {
            if let Ok(parsed) = v.parse() {
                self.agent.llm.temperature = parsed;
            }
        }
        if let Some(v) = var("LLM_TIMEOUT_MS") {
            if let Ok(parsed) = v.parse() {
                self.agent.llm.timeout_ms = parsed;
            }
        }

        if let Some(v) = var("TTS_MODEL") {
            self.agent.tts.model = v;
        }
        if let Some(v) = var("TTS_VOICE_ID") {
            self.agent.tts.voice_id = Some(v);
        }

        if let Some(v) = var("DEFAULT_AGENT_INSTRUCTIONS") {
            self.agent.instructions = v;
        }
    }
}

/// Load settings from files and environment
///
/// Priority (highest to lowest):
/// 1. Well-known environment names (`LIVEKIT_URL`, `STT_MODEL`, ...)
/// 2. `CALLAGENT__`-prefixed environment variables
/// 3. config/{env}.yaml (if env specified)
/// 4. config/default.yaml
pub fn load_settings(env: Option<&str>) -> Result<Settings, ConfigError> {
    let mut builder = Config::builder();

    builder = builder.add_source(File::with_name("config/default").required(false));

    if let Some(env_name) = env {
        builder = builder.add_source(File::with_name(&format!("config/{}", env_name)).required(false));
    }

    builder = builder.add_source(
        Environment::with_prefix("CALLAGENT")
            .separator("__")
            .try_parsing(true),
    );

    let config = builder.build()?;
    let mut settings: Settings = config.try_deserialize()?;

    settings.apply_well_known_env();

    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.worker.name, "outbound-caller");
        assert_eq!(settings.worker.shutdown_grace_ms, 5_000);
        assert_eq!(settings.session.final_debounce_ms, 200);
    }

    #[test]
    fn test_validation_requires_control_plane() {
        let settings = Settings::default();
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::Missing("control.url (LIVEKIT_URL)"))
        ));

        let mut settings = Settings::default();
        settings.control.url = "wss://rooms.example".to_string();
        settings.control.api_key = "key".to_string();
        settings.control.api_secret = "secret".to_string();
        settings.control.sip_trunk_id = "ST_trunk".to_string();
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_huge_endpointing() {
        let mut settings = Settings::default();
        settings.control.url = "wss://rooms.example".to_string();
        settings.control.api_key = "key".to_string();
        settings.control.api_secret = "secret".to_string();
        settings.control.sip_trunk_id = "ST_trunk".to_string();
        settings.session.endpointing_silence_ms = 5_000;
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }
}
