//! Configuration loading and validation.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level Switchboard configuration.
///
/// Loaded from JSON5 with `${ENV_VAR}` substitution; every section is
/// optional and falls back to built-in defaults through the accessor
/// methods below.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<ServerConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub llm: Option<LlmConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub stt: Option<SttConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tts: Option<TtsConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool: Option<PoolConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub pipeline: Option<PipelineConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub scenario: Option<ScenarioConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind: Option<String>,
}

fn default_port() -> u16 {
    18850
}

/// LLM provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Provider id: "openai", "openrouter", or "ollama".
    #[serde(default = "default_llm_provider")]
    pub provider: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_timeout_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tool_iterations: Option<u32>,
}

fn default_llm_provider() -> String {
    "openai".to_string()
}

impl LlmConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
    }
}

/// Speech-to-text provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SttConfig {
    /// Provider id: "groq" or "openai".
    #[serde(default = "default_stt_provider")]
    pub provider: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

fn default_stt_provider() -> String {
    "groq".to_string()
}

impl SttConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
    }
}

/// Text-to-speech provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsConfig {
    #[serde(default = "default_tts_provider")]
    pub provider: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_voice: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
}

fn default_tts_provider() -> String {
    "elevenlabs".to_string()
}

impl TtsConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
    }
}

/// Per-kind pool tuning.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stt: Option<PoolSettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tts: Option<PoolSettings>,
}

/// Resolved pool tuning for one resource kind.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PoolSettings {
    #[serde(default = "default_target_warm")]
    pub target_warm: usize,
    #[serde(default = "default_max_age_secs")]
    pub max_age_secs: u64,
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
}

fn default_target_warm() -> usize {
    2
}

fn default_max_age_secs() -> u64 {
    300
}

fn default_refresh_interval_secs() -> u64 {
    30
}

fn default_acquire_timeout_ms() -> u64 {
    5_000
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            target_warm: default_target_warm(),
            max_age_secs: default_max_age_secs(),
            refresh_interval_secs: default_refresh_interval_secs(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
        }
    }
}

impl PoolSettings {
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

/// Audio pipeline tuning.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    /// RMS energy threshold above which a frame counts as speech.
    #[serde(default = "default_vad_threshold")]
    pub vad_threshold: f64,
    /// Consecutive silent frames after speech that end an utterance.
    #[serde(default = "default_min_silence_frames")]
    pub min_silence_frames: usize,
    /// Consecutive speech frames while speaking that count as barge-in.
    #[serde(default = "default_barge_in_frames")]
    pub barge_in_min_speech_frames: usize,
    /// Capacity of the bounded audio frame channels.
    #[serde(default = "default_frame_capacity")]
    pub frame_capacity: usize,
}

fn default_sample_rate() -> u32 {
    16_000
}

fn default_vad_threshold() -> f64 {
    300.0
}

fn default_min_silence_frames() -> usize {
    15
}

fn default_barge_in_frames() -> usize {
    5
}

fn default_frame_capacity() -> usize {
    64
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            sample_rate: default_sample_rate(),
            vad_threshold: default_vad_threshold(),
            min_silence_frames: default_min_silence_frames(),
            barge_in_min_speech_frames: default_barge_in_frames(),
            frame_capacity: default_frame_capacity(),
        }
    }
}

impl PipelineConfig {
    /// Samples per 20ms frame at the configured sample rate.
    pub fn frame_samples(&self) -> usize {
        (self.sample_rate as usize) / 50
    }

    /// Wall-clock duration of one frame window.
    pub fn frame_duration(&self) -> Duration {
        Duration::from_millis(20)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Session store directory (supports `~`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store_dir: Option<String>,
    #[serde(default = "default_session_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_session_ttl_secs() -> u64 {
    86_400
}

fn default_idle_timeout_secs() -> u64 {
    300
}

fn default_sweep_interval_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioConfig {
    /// Path to the scenario YAML document (supports `~`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// "plain" or "json".
    #[serde(default = "default_log_format")]
    pub format: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
    /// Extra per-target filter directives, e.g. "switchboard_pool=debug".
    #[serde(default)]
    pub filters: Vec<String>,
}

fn default_log_format() -> String {
    "plain".to_string()
}

/// Resolve a secret: check the direct value first, then the env-var reference.
pub fn resolve_secret_field(direct: &Option<String>, env_var: &Option<String>) -> Option<String> {
    if let Some(val) = direct {
        if !val.is_empty() {
            return Some(val.clone());
        }
    }
    if let Some(env) = env_var {
        if let Ok(val) = std::env::var(env) {
            if !val.is_empty() {
                return Some(val);
            }
        }
    }
    None
}

/// Substitute `${ENV_VAR}` patterns in a string with their environment variable values.
fn substitute_env_vars(input: &str) -> String {
    let re = regex::Regex::new(r"\$\{([^}]+)\}").unwrap();
    re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        std::env::var(var_name).unwrap_or_default()
    })
    .into_owned()
}

impl Config {
    /// Load config from a JSON5 file, substituting `${ENV_VAR}` references.
    pub fn load(path: &Path) -> crate::error::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path).map_err(crate::error::SwitchboardError::Io)?;
        let substituted = substitute_env_vars(&raw);

        let config: Config = json5::from_str(&substituted)
            .map_err(|e| crate::error::SwitchboardError::Config(e.to_string()))?;

        Ok(config)
    }

    /// Default config file location: `~/.switchboard/config.json`
    pub fn default_config_path() -> PathBuf {
        data_dir().join("config.json")
    }

    pub fn server_port(&self) -> u16 {
        self.server.as_ref().map(|s| s.port).unwrap_or_else(default_port)
    }

    pub fn server_bind(&self) -> String {
        self.server
            .as_ref()
            .and_then(|s| s.bind.clone())
            .unwrap_or_else(|| "127.0.0.1".to_string())
    }

    pub fn llm_model(&self) -> String {
        self.llm
            .as_ref()
            .and_then(|l| l.model.clone())
            .unwrap_or_else(|| "gpt-4o-mini".to_string())
    }

    pub fn llm_max_tokens(&self) -> u32 {
        self.llm.as_ref().and_then(|l| l.max_tokens).unwrap_or(1024)
    }

    pub fn llm_temperature(&self) -> Option<f64> {
        self.llm.as_ref().and_then(|l| l.temperature)
    }

    pub fn llm_request_timeout(&self) -> Duration {
        let ms = self
            .llm
            .as_ref()
            .and_then(|l| l.request_timeout_ms)
            .unwrap_or(15_000);
        Duration::from_millis(ms)
    }

    pub fn max_tool_iterations(&self) -> u32 {
        self.llm
            .as_ref()
            .and_then(|l| l.max_tool_iterations)
            .unwrap_or(8)
    }

    pub fn stt_model(&self) -> String {
        self.stt
            .as_ref()
            .and_then(|s| s.model.clone())
            .unwrap_or_else(|| "whisper-large-v3-turbo".to_string())
    }

    pub fn tts_voice(&self) -> String {
        self.tts
            .as_ref()
            .and_then(|t| t.default_voice.clone())
            .unwrap_or_else(|| "Rachel".to_string())
    }

    pub fn tts_model(&self) -> String {
        self.tts
            .as_ref()
            .and_then(|t| t.default_model.clone())
            .unwrap_or_else(|| "eleven_turbo_v2".to_string())
    }

    pub fn stt_pool(&self) -> PoolSettings {
        self.pool
            .as_ref()
            .and_then(|p| p.stt)
            .unwrap_or_default()
    }

    pub fn tts_pool(&self) -> PoolSettings {
        self.pool
            .as_ref()
            .and_then(|p| p.tts)
            .unwrap_or_default()
    }

    pub fn pipeline_settings(&self) -> PipelineConfig {
        self.pipeline.unwrap_or_default()
    }

    pub fn session_ttl(&self) -> Duration {
        let secs = self
            .session
            .as_ref()
            .map(|s| s.ttl_secs)
            .unwrap_or_else(default_session_ttl_secs);
        Duration::from_secs(secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        let secs = self
            .session
            .as_ref()
            .map(|s| s.idle_timeout_secs)
            .unwrap_or_else(default_idle_timeout_secs);
        Duration::from_secs(secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        let secs = self
            .session
            .as_ref()
            .map(|s| s.sweep_interval_secs)
            .unwrap_or_else(default_sweep_interval_secs);
        Duration::from_secs(secs)
    }

    /// Session store directory, `~`-expanded.
    pub fn store_dir(&self) -> PathBuf {
        self.session
            .as_ref()
            .and_then(|s| s.store_dir.as_ref())
            .map(|d| {
                let expanded = shellexpand::tilde(d);
                PathBuf::from(expanded.as_ref())
            })
            .unwrap_or_else(|| data_dir().join("sessions"))
    }

    /// Scenario document path, `~`-expanded.
    pub fn scenario_path(&self) -> PathBuf {
        self.scenario
            .as_ref()
            .and_then(|s| s.path.as_ref())
            .map(|p| {
                let expanded = shellexpand::tilde(p);
                PathBuf::from(expanded.as_ref())
            })
            .unwrap_or_else(|| data_dir().join("scenario.yaml"))
    }

    pub fn log_level(&self) -> Option<String> {
        self.logging.as_ref().and_then(|l| l.level.clone())
    }

    /// Validate config, returning (warnings, errors).
    pub fn validate(&self) -> (Vec<String>, Vec<String>) {
        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        if let Some(server) = &self.server {
            if server.port == 0 {
                errors.push("Server port cannot be 0".to_string());
            }
        }

        if let Some(llm) = &self.llm {
            if llm.provider != "ollama" && llm.resolve_api_key().is_none() {
                warnings.push(format!(
                    "LLM provider '{}' has no API key configured",
                    llm.provider
                ));
            }
        }
        if let Some(stt) = &self.stt {
            if stt.resolve_api_key().is_none() {
                warnings.push(format!(
                    "STT provider '{}' has no API key configured",
                    stt.provider
                ));
            }
        }
        if let Some(tts) = &self.tts {
            if tts.resolve_api_key().is_none() {
                warnings.push(format!(
                    "TTS provider '{}' has no API key configured",
                    tts.provider
                ));
            }
        }

        for (kind, settings) in [("stt", self.stt_pool()), ("tts", self.tts_pool())] {
            if settings.target_warm == 0 {
                warnings.push(format!(
                    "Pool '{kind}' has target_warm = 0; every session pays cold-start latency"
                ));
            }
            if settings.acquire_timeout_ms == 0 {
                errors.push(format!("Pool '{kind}' acquire_timeout_ms cannot be 0"));
            }
        }

        if let Some(scenario) = &self.scenario {
            if scenario.path.is_some() && !self.scenario_path().exists() {
                errors.push(format!(
                    "Scenario document not found: {}",
                    self.scenario_path().display()
                ));
            }
        }

        let pipeline = self.pipeline_settings();
        if pipeline.min_silence_frames == 0 {
            errors.push("pipeline.min_silence_frames cannot be 0".to_string());
        }
        if pipeline.sample_rate % 50 != 0 {
            warnings.push(format!(
                "pipeline.sample_rate {} does not divide into 20ms frames evenly",
                pipeline.sample_rate
            ));
        }

        (warnings, errors)
    }

    /// Save config to a file.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

/// Base directory for Switchboard data: `~/.switchboard/`
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".switchboard")
}
