//! Speech synthesis: the capability trait plus a streaming HTTP client
//! for ElevenLabs-style endpoints.

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::debug;

use switchboard_core::config::TtsConfig;
use switchboard_core::error::{Result, SwitchboardError};
use switchboard_core::scenario::VoiceConfig;

pub const DEFAULT_TTS_BASE_URL: &str = "https://api.elevenlabs.io";

/// A text-to-speech connection. Pooled per session.
///
/// `synthesize` streams raw PCM16 chunks into `chunk_tx` as they arrive
/// from the provider and returns once the stream ends. Dropping the
/// receiver stops the stream early; implementations must treat that as a
/// normal stop, not an error.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(
        &self,
        text: &str,
        voice: &VoiceConfig,
        chunk_tx: mpsc::Sender<Vec<u8>>,
    ) -> Result<()>;
}

/// Streaming synthesizer for ElevenLabs-style endpoints, emitting
/// `pcm_16000` audio.
#[derive(Clone, Debug)]
pub struct HttpSynthesizer {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    default_voice: String,
    default_model: String,
}

impl HttpSynthesizer {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        default_voice: impl Into<String>,
        default_model: impl Into<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            default_voice: default_voice.into(),
            default_model: default_model.into(),
        }
    }

    pub fn from_config(config: &TtsConfig, voice: &str, model: &str) -> Result<Self> {
        let api_key = config.resolve_api_key().ok_or_else(|| {
            SwitchboardError::Config("No TTS API key configured".to_string())
        })?;
        Ok(Self::new(DEFAULT_TTS_BASE_URL, api_key, voice, model))
    }

    fn stream_url(&self, voice: &str) -> String {
        format!("{}/v1/text-to-speech/{voice}/stream", self.base_url)
    }

    fn request_body(&self, text: &str, voice: &VoiceConfig) -> serde_json::Value {
        let model = voice.model.as_deref().unwrap_or(&self.default_model);
        let mut body = serde_json::json!({
            "text": text,
            "model_id": model,
            "output_format": "pcm_16000",
        });
        if let Some(speed) = voice.speed {
            body["voice_settings"] = serde_json::json!({ "speed": speed });
        }
        body
    }
}

#[async_trait]
impl SpeechSynthesizer for HttpSynthesizer {
    async fn synthesize(
        &self,
        text: &str,
        voice: &VoiceConfig,
        chunk_tx: mpsc::Sender<Vec<u8>>,
    ) -> Result<()> {
        let voice_id = voice.voice_id.as_deref().unwrap_or(&self.default_voice);
        let url = self.stream_url(voice_id);
        debug!(voice = %voice_id, text_len = text.len(), "Starting synthesis stream");

        let resp = self
            .client
            .post(&url)
            .header("xi-api-key", &self.api_key)
            .header("Content-Type", "application/json")
            .json(&self.request_body(text, voice))
            .send()
            .await
            .map_err(|e| SwitchboardError::UpstreamServiceError {
                service: "tts".to_string(),
                message: e.to_string(),
            })?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(SwitchboardError::UpstreamServiceError {
                service: "tts".to_string(),
                message: format!("synthesis API returned {status}: {body}"),
            });
        }

        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let bytes = chunk.map_err(|e| SwitchboardError::UpstreamServiceError {
                service: "tts".to_string(),
                message: format!("synthesis stream error: {e}"),
            })?;
            if chunk_tx.send(bytes.to_vec()).await.is_err() {
                debug!("Synthesis receiver dropped; stopping stream");
                break;
            }
        }

        Ok(())
    }
}
