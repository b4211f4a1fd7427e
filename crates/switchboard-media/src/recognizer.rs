//! Speech recognition: the capability trait plus an HTTP transcription
//! client for Whisper-style endpoints.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use switchboard_core::config::SttConfig;
use switchboard_core::error::{Result, SwitchboardError};

/// Capacity of the frame sink feeding a recognizer stream. At 20 ms per
/// frame this buffers a little over a second of audio while a prior
/// utterance is still in flight at the provider.
const FRAME_SINK_CAPACITY: usize = 64;

const TRANSCRIPT_CAPACITY: usize = 8;

/// Input to a recognizer stream.
#[derive(Debug, Clone)]
pub enum FrameSignal {
    /// One window of 16 kHz mono PCM16 samples.
    Pcm(Vec<i16>),
    /// The current utterance is complete; finalize it.
    EndOfUtterance,
}

/// Transcript emitted by a recognizer stream. Streaming recognizers may
/// emit interim results with `is_final = false`; exactly one final event
/// closes each utterance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptEvent {
    pub text: String,
    pub is_final: bool,
}

/// A live recognition stream for one session: frames in, transcripts out.
pub struct RecognizerStream {
    pub frames: mpsc::Sender<FrameSignal>,
    pub transcripts: mpsc::Receiver<TranscriptEvent>,
}

/// A speech-to-text connection. Pooled per session; `start` may be called
/// once per acquisition.
#[async_trait]
pub trait SpeechRecognizer: Send + Sync {
    async fn start(&self, session_id: &str) -> Result<RecognizerStream>;
}

/// Wrap raw PCM16 samples in a WAV container.
pub fn pcm_to_wav(pcm: &[i16], sample_rate: u32) -> Vec<u8> {
    const CHANNELS: u16 = 1;
    const BITS_PER_SAMPLE: u16 = 16;
    let data_len = (pcm.len() * 2) as u32;
    let byte_rate = sample_rate * u32::from(CHANNELS) * u32::from(BITS_PER_SAMPLE) / 8;
    let block_align = CHANNELS * BITS_PER_SAMPLE / 8;

    let mut wav = Vec::with_capacity(44 + data_len as usize);
    wav.extend_from_slice(b"RIFF");
    wav.extend_from_slice(&(36 + data_len).to_le_bytes());
    wav.extend_from_slice(b"WAVE");
    wav.extend_from_slice(b"fmt ");
    wav.extend_from_slice(&16u32.to_le_bytes());
    wav.extend_from_slice(&1u16.to_le_bytes()); // PCM
    wav.extend_from_slice(&CHANNELS.to_le_bytes());
    wav.extend_from_slice(&sample_rate.to_le_bytes());
    wav.extend_from_slice(&byte_rate.to_le_bytes());
    wav.extend_from_slice(&block_align.to_le_bytes());
    wav.extend_from_slice(&BITS_PER_SAMPLE.to_le_bytes());
    wav.extend_from_slice(b"data");
    wav.extend_from_slice(&data_len.to_le_bytes());
    for &sample in pcm {
        wav.extend_from_slice(&sample.to_le_bytes());
    }
    wav
}

/// Transcription endpoint for a provider id.
pub fn transcription_url(provider: &str) -> &'static str {
    match provider {
        "openai" => "https://api.openai.com/v1/audio/transcriptions",
        _ => "https://api.groq.com/openai/v1/audio/transcriptions",
    }
}

/// Buffer-and-post recognizer: accumulates utterance PCM, wraps it in a
/// WAV container, and posts it multipart to a Whisper-style endpoint.
/// Emits one final transcript event per utterance; a failed request drops
/// the utterance with a warning rather than killing the stream.
#[derive(Clone, Debug)]
pub struct HttpRecognizer {
    client: reqwest::Client,
    url: String,
    api_key: String,
    model: String,
    sample_rate: u32,
}

impl HttpRecognizer {
    pub fn new(
        url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        sample_rate: u32,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            api_key: api_key.into(),
            model: model.into(),
            sample_rate,
        }
    }

    pub fn from_config(config: &SttConfig, model: &str, sample_rate: u32) -> Result<Self> {
        let api_key = config.resolve_api_key().ok_or_else(|| {
            SwitchboardError::Config("No STT API key configured".to_string())
        })?;
        Ok(Self::new(
            transcription_url(&config.provider),
            api_key,
            model,
            sample_rate,
        ))
    }

    async fn transcribe(&self, pcm: &[i16]) -> Result<String> {
        let wav = pcm_to_wav(pcm, self.sample_rate);
        debug!(
            url = %self.url,
            model = %self.model,
            wav_bytes = wav.len(),
            "Posting utterance for transcription"
        );

        let part = reqwest::multipart::Part::bytes(wav)
            .file_name("utterance.wav")
            .mime_str("audio/wav")
            .map_err(|e| SwitchboardError::UpstreamServiceError {
                service: "stt".to_string(),
                message: e.to_string(),
            })?;
        let form = reqwest::multipart::Form::new()
            .text("model", self.model.clone())
            .text("response_format", "text")
            .part("file", part);

        let resp = self
            .client
            .post(&self.url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .multipart(form)
            .send()
            .await
            .map_err(|e| SwitchboardError::UpstreamServiceError {
                service: "stt".to_string(),
                message: e.to_string(),
            })?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(SwitchboardError::UpstreamServiceError {
                service: "stt".to_string(),
                message: format!("transcription API returned {status}: {body}"),
            });
        }

        let text = resp
            .text()
            .await
            .map_err(|e| SwitchboardError::UpstreamServiceError {
                service: "stt".to_string(),
                message: e.to_string(),
            })?;
        Ok(text.trim().to_string())
    }
}

#[async_trait]
impl SpeechRecognizer for HttpRecognizer {
    async fn start(&self, session_id: &str) -> Result<RecognizerStream> {
        let (frame_tx, mut frame_rx) = mpsc::channel::<FrameSignal>(FRAME_SINK_CAPACITY);
        let (transcript_tx, transcript_rx) = mpsc::channel::<TranscriptEvent>(TRANSCRIPT_CAPACITY);

        let this = self.clone();
        let session = session_id.to_string();
        tokio::spawn(async move {
            let mut buffer: Vec<i16> = Vec::new();
            while let Some(signal) = frame_rx.recv().await {
                match signal {
                    FrameSignal::Pcm(samples) => buffer.extend_from_slice(&samples),
                    FrameSignal::EndOfUtterance => {
                        if buffer.is_empty() {
                            continue;
                        }
                        let pcm = std::mem::take(&mut buffer);
                        match this.transcribe(&pcm).await {
                            Ok(text) if text.is_empty() => {
                                debug!(session = %session, "Empty transcript discarded");
                            }
                            Ok(text) => {
                                let event = TranscriptEvent {
                                    text,
                                    is_final: true,
                                };
                                if transcript_tx.send(event).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                warn!(
                                    session = %session,
                                    error = %e,
                                    "Transcription failed; utterance dropped"
                                );
                            }
                        }
                    }
                }
            }
            debug!(session = %session, "Recognizer stream ended");
        });

        Ok(RecognizerStream {
            frames: frame_tx,
            transcripts: transcript_rx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wav_container_layout() {
        let pcm = vec![0i16; 8_000]; // half a second at 16kHz
        let wav = pcm_to_wav(&pcm, 16_000);

        assert_eq!(wav.len(), 44 + 16_000);
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
        assert_eq!(&wav[12..16], b"fmt ");
        assert_eq!(&wav[36..40], b"data");

        let sample_rate = u32::from_le_bytes([wav[24], wav[25], wav[26], wav[27]]);
        assert_eq!(sample_rate, 16_000);
        let data_len = u32::from_le_bytes([wav[40], wav[41], wav[42], wav[43]]);
        assert_eq!(data_len, 16_000);
    }

    #[test]
    fn wav_samples_are_little_endian() {
        let wav = pcm_to_wav(&[0x0102, -2], 16_000);
        assert_eq!(&wav[44..46], &[0x02, 0x01]);
        assert_eq!(&wav[46..48], &(-2i16).to_le_bytes());
    }

    #[test]
    fn provider_urls() {
        assert!(transcription_url("openai").contains("api.openai.com"));
        assert!(transcription_url("groq").contains("api.groq.com"));
        // Unknown providers fall back to the Groq-compatible endpoint.
        assert!(transcription_url("something-else").contains("api.groq.com"));
    }

    #[test]
    fn from_config_requires_an_api_key() {
        let config = SttConfig {
            provider: "groq".to_string(),
            api_key: None,
            api_key_env: None,
            model: None,
        };
        let err = HttpRecognizer::from_config(&config, "whisper-large-v3-turbo", 16_000)
            .unwrap_err();
        assert_eq!(err.kind(), "config");
    }
}
