//! Wires a [`Config`] into a running [`SessionManager`]: provider-backed
//! pool factories, the retrying LLM client, the on-disk session store, and
//! the agent registry parsed from the scenario document.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use switchboard_agents::{AgentRegistry, ToolRegistry};
use switchboard_core::config::{Config, LlmConfig, SttConfig, TtsConfig};
use switchboard_core::error::{Result, SwitchboardError};
use switchboard_core::scenario::ScenarioDoc;
use switchboard_core::store::JsonSessionStore;
use switchboard_media::recognizer::HttpRecognizer;
use switchboard_media::synthesizer::HttpSynthesizer;
use switchboard_media::{SpeechRecognizer, SpeechSynthesizer};
use switchboard_orchestrator::{ManagerSettings, SessionManager};
use switchboard_pool::{ResourceFactory, ResourcePool};
use switchboard_providers::{LlmClient, OpenAiCompatClient, RetryClient};
use tracing::info;

/// Backoff between LLM retry attempts.
const LLM_RETRY_BACKOFF: Duration = Duration::from_millis(400);

/// Mints speech-to-text connections for the STT pool.
pub struct RecognizerFactory {
    config: SttConfig,
    model: String,
    sample_rate: u32,
}

#[async_trait]
impl ResourceFactory<Box<dyn SpeechRecognizer>> for RecognizerFactory {
    async fn create(&self) -> anyhow::Result<Box<dyn SpeechRecognizer>> {
        let recognizer = HttpRecognizer::from_config(&self.config, &self.model, self.sample_rate)?;
        Ok(Box::new(recognizer))
    }
}

/// Mints text-to-speech connections for the TTS pool.
pub struct SynthesizerFactory {
    config: TtsConfig,
    voice: String,
    model: String,
}

#[async_trait]
impl ResourceFactory<Box<dyn SpeechSynthesizer>> for SynthesizerFactory {
    async fn create(&self) -> anyhow::Result<Box<dyn SpeechSynthesizer>> {
        let synthesizer = HttpSynthesizer::from_config(&self.config, &self.voice, &self.model)?;
        Ok(Box::new(synthesizer))
    }
}

/// Provider sections fall back to the conventional env var for their default
/// provider, so an empty config file still boots when the keys are exported.
fn llm_section(config: &Config) -> LlmConfig {
    config.llm.clone().unwrap_or_else(|| LlmConfig {
        provider: "openai".to_string(),
        api_key: None,
        api_key_env: Some("OPENAI_API_KEY".to_string()),
        base_url: None,
        model: None,
        max_tokens: None,
        temperature: None,
        request_timeout_ms: None,
        max_tool_iterations: None,
    })
}

fn stt_section(config: &Config) -> SttConfig {
    config.stt.clone().unwrap_or_else(|| SttConfig {
        provider: "groq".to_string(),
        api_key: None,
        api_key_env: Some("GROQ_API_KEY".to_string()),
        model: None,
    })
}

fn tts_section(config: &Config) -> TtsConfig {
    config.tts.clone().unwrap_or_else(|| TtsConfig {
        provider: "elevenlabs".to_string(),
        api_key: None,
        api_key_env: Some("ELEVENLABS_API_KEY".to_string()),
        default_voice: None,
        default_model: None,
    })
}

/// The completion client every turn goes through: provider-compatible HTTP
/// with retry on transient upstream failures.
pub fn build_llm(config: &Config) -> Result<Arc<dyn LlmClient>> {
    let section = llm_section(config);
    let client = OpenAiCompatClient::from_config(&section, config.llm_request_timeout())?;
    info!(provider = %section.provider, model = %config.llm_model(), "LLM client ready");
    Ok(Arc::new(RetryClient::new(
        Arc::new(client),
        LLM_RETRY_BACKOFF,
    )))
}

/// Assemble the full session stack from configuration.
///
/// Fails fast on a missing scenario document or missing provider credentials
/// rather than surfacing those as per-session errors later. The caller still
/// owns lifecycle: call [`SessionManager::start_upkeep`] to begin pool
/// maintenance and idle sweeps.
pub fn build_manager(config: &Config) -> Result<Arc<SessionManager>> {
    let scenario_path = config.scenario_path();
    let doc = ScenarioDoc::load_from_file(&scenario_path)?;
    let registry = AgentRegistry::from_scenario(&doc)?;
    info!(
        scenario = %registry.scenario_name(),
        agents = registry.agent_names().len(),
        path = %scenario_path.display(),
        "Scenario loaded"
    );

    let llm = build_llm(config)?;

    let stt = stt_section(config);
    if stt.resolve_api_key().is_none() {
        return Err(SwitchboardError::Config(format!(
            "No STT API key configured for provider '{}'",
            stt.provider
        )));
    }
    let pipeline = config.pipeline_settings();
    let stt_factory = RecognizerFactory {
        config: stt,
        model: config.stt_model(),
        sample_rate: pipeline.sample_rate,
    };
    let stt_pool = ResourcePool::new("stt", config.stt_pool(), Arc::new(stt_factory));

    let tts = tts_section(config);
    if tts.resolve_api_key().is_none() {
        return Err(SwitchboardError::Config(format!(
            "No TTS API key configured for provider '{}'",
            tts.provider
        )));
    }
    let tts_factory = SynthesizerFactory {
        config: tts,
        voice: config.tts_voice(),
        model: config.tts_model(),
    };
    let tts_pool = ResourcePool::new("tts", config.tts_pool(), Arc::new(tts_factory));

    let store = Arc::new(JsonSessionStore::new(
        config.store_dir(),
        config.session_ttl(),
    ));
    info!(dir = %config.store_dir().display(), "Session store ready");

    Ok(SessionManager::new(
        registry,
        Arc::new(ToolRegistry::new()),
        llm,
        store,
        stt_pool,
        tts_pool,
        ManagerSettings::from_config(config),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scenario_file(dir: &std::path::Path) -> std::path::PathBuf {
        let path = dir.join("scenario.yaml");
        std::fs::write(
            &path,
            r#"
name: smoke
start_agent: Greeter
agents:
  - name: Greeter
    system_prompt: You greet people.
    greeting: Hello.
handoffs: []
"#,
        )
        .unwrap();
        path
    }

    fn config_with(dir: &std::path::Path, json: &str) -> Config {
        let path = dir.join("config.json");
        std::fs::write(&path, json).unwrap();
        Config::load(&path).unwrap()
    }

    #[test]
    fn missing_stt_key_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let scenario = scenario_file(dir.path());
        let config = config_with(
            dir.path(),
            &format!(
                r#"{{
                    "llm": {{ "provider": "ollama" }},
                    "stt": {{ "provider": "groq" }},
                    "scenario": {{ "path": "{}" }}
                }}"#,
                scenario.display()
            ),
        );
        let err = build_manager(&config).unwrap_err();
        assert_eq!(err.kind(), "config");
        assert!(err.to_string().contains("STT"));
    }

    #[test]
    fn missing_scenario_document_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_with(
            dir.path(),
            &format!(
                r#"{{ "scenario": {{ "path": "{}/absent.yaml" }} }}"#,
                dir.path().display()
            ),
        );
        assert!(build_manager(&config).is_err());
    }

    #[test]
    fn full_stack_builds_with_direct_keys() {
        let dir = tempfile::tempdir().unwrap();
        let scenario = scenario_file(dir.path());
        let config = config_with(
            dir.path(),
            &format!(
                r#"{{
                    "llm": {{ "provider": "openai", "api_key": "sk-test" }},
                    "stt": {{ "provider": "groq", "api_key": "gsk-test" }},
                    "tts": {{ "provider": "elevenlabs", "api_key": "el-test" }},
                    "session": {{ "store_dir": "{}/sessions" }},
                    "scenario": {{ "path": "{}" }}
                }}"#,
                dir.path().display(),
                scenario.display()
            ),
        );
        let manager = build_manager(&config).unwrap();
        manager.shutdown();
    }
}
