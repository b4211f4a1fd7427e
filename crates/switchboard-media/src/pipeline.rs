//! Per-session speech pipeline: audio frames in, utterance events out,
//! synthesized audio back, with barge-in handling in between.
//!
//! Three tasks cooperate per session. The inbound task assembles PCM
//! frames, runs VAD, and feeds the recognizer. The speak path forwards
//! synthesis chunks to the transport. Barge-in is a cancellation signal
//! sent from the inbound task straight to the speak path, so interrupt
//! latency does not depend on how busy the orchestrator is.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use switchboard_core::config::PipelineConfig;
use switchboard_core::error::{Result, SwitchboardError};
use switchboard_core::scenario::VoiceConfig;
use switchboard_pool::{PoolResource, ResourcePool};

use crate::recognizer::{FrameSignal, RecognizerStream, SpeechRecognizer};
use crate::synthesizer::SpeechSynthesizer;
use crate::vad::{VadEvent, VoiceActivityDetector};

pub type RecognizerPool = ResourcePool<Box<dyn SpeechRecognizer>>;
pub type SynthesizerPool = ResourcePool<Box<dyn SpeechSynthesizer>>;

const EVENT_CAPACITY: usize = 32;

/// Where the session's audio loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// Not yet started.
    Idle,
    /// Classifying inbound frames, waiting for the caller to speak.
    Listening,
    /// An utterance went out; no response has started playing yet.
    Waiting,
    /// Synthesized audio is being emitted to the transport.
    Speaking,
    /// Torn down; pooled resources have been released.
    Closed,
}

/// What the pipeline reports upward to its single consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineEvent {
    /// A finalized utterance transcript.
    UtteranceComplete { transcript: String },
    /// An interim transcript from a streaming recognizer.
    PartialTranscript { text: String },
    /// The caller interrupted playback; outbound audio was cancelled.
    BargeIn,
    /// The pipeline shut down and released its resources.
    Closed,
}

struct Shared {
    session_id: String,
    state: watch::Sender<PipelineState>,
    speak_cancel: Mutex<CancellationToken>,
}

impl Shared {
    fn state(&self) -> PipelineState {
        *self.state.borrow()
    }

    async fn cancel_speaking(&self) {
        self.speak_cancel.lock().await.cancel();
    }
}

/// Control surface for one session's pipeline. Cheap to clone.
#[derive(Clone)]
pub struct PipelineHandle {
    audio_in: mpsc::Sender<Vec<u8>>,
    speaker: Arc<Speaker>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
}

impl PipelineHandle {
    /// Sender for raw PCM16LE bytes from the transport.
    pub fn audio_sender(&self) -> mpsc::Sender<Vec<u8>> {
        self.audio_in.clone()
    }

    pub fn speaker(&self) -> Arc<Speaker> {
        Arc::clone(&self.speaker)
    }

    pub fn state(&self) -> PipelineState {
        self.shared.state()
    }

    /// Tear the pipeline down. Idempotent; the `Closed` event confirms.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

/// Builds and wires the per-session audio tasks.
pub struct SpeechPipelineCoordinator;

impl SpeechPipelineCoordinator {
    /// Acquire speech resources for the session and start its audio
    /// loop. Returns the control handle plus the event stream consumed
    /// by the orchestrator.
    pub async fn start(
        session_id: &str,
        config: PipelineConfig,
        stt_pool: Arc<RecognizerPool>,
        tts_pool: Arc<SynthesizerPool>,
        audio_out: mpsc::Sender<Vec<u8>>,
        acquire_timeout: Duration,
    ) -> Result<(PipelineHandle, mpsc::Receiver<PipelineEvent>)> {
        let stt = stt_pool
            .acquire_for_session(session_id, acquire_timeout)
            .await?;
        let tts = match tts_pool
            .acquire_for_session(session_id, acquire_timeout)
            .await
        {
            Ok(handle) => handle,
            Err(e) => {
                stt_pool.release_for_session(session_id).await;
                return Err(e);
            }
        };
        let stream = match stt.start(session_id).await {
            Ok(stream) => stream,
            Err(e) => {
                stt_pool.release_for_session(session_id).await;
                tts_pool.release_for_session(session_id).await;
                return Err(e);
            }
        };

        let shared = Arc::new(Shared {
            session_id: session_id.to_string(),
            state: watch::Sender::new(PipelineState::Idle),
            speak_cancel: Mutex::new(CancellationToken::new()),
        });
        let cancel = CancellationToken::new();
        let (audio_in, audio_rx) = mpsc::channel::<Vec<u8>>(config.frame_capacity);
        let (event_tx, event_rx) = mpsc::channel::<PipelineEvent>(EVENT_CAPACITY);

        let speaker = Arc::new(Speaker {
            shared: Arc::clone(&shared),
            synth: tts,
            audio_out,
            chunk_capacity: config.frame_capacity,
        });

        let inbound = InboundTask {
            config,
            shared: Arc::clone(&shared),
            vad: VoiceActivityDetector::new(config.vad_threshold, 1, config.min_silence_frames),
            pending_byte: None,
            samples: Vec::new(),
            preroll: VecDeque::new(),
            preroll_capacity: (config.barge_in_min_speech_frames + 2).max(10),
            stt,
            stt_pool,
            tts_pool,
        };
        shared.state.send_replace(PipelineState::Listening);
        info!(session = %session_id, "Speech pipeline started");
        tokio::spawn(inbound.run(audio_rx, stream, event_tx, cancel.clone()));

        let handle = PipelineHandle {
            audio_in,
            speaker,
            shared,
            cancel,
        };
        Ok((handle, event_rx))
    }
}

/// Outbound half of the pipeline: synthesizes a reply and forwards the
/// chunks to the transport. One utterance at a time; callers serialize.
pub struct Speaker {
    shared: Arc<Shared>,
    synth: PoolResource<Box<dyn SpeechSynthesizer>>,
    audio_out: mpsc::Sender<Vec<u8>>,
    chunk_capacity: usize,
}

impl Speaker {
    /// Synthesize `text` and play it out. Returns `Ok(true)` when the
    /// whole utterance was delivered and `Ok(false)` when it was cut off
    /// by barge-in, shutdown, or a dropped transport.
    pub async fn speak(&self, text: &str, voice: &VoiceConfig) -> Result<bool> {
        if text.is_empty() {
            return Ok(true);
        }
        if self.shared.state() == PipelineState::Closed {
            return Err(SwitchboardError::Session(
                "speech pipeline is closed".to_string(),
            ));
        }

        let token = CancellationToken::new();
        *self.shared.speak_cancel.lock().await = token.clone();
        self.shared.state.send_replace(PipelineState::Speaking);

        let (chunk_tx, mut chunk_rx) = mpsc::channel::<Vec<u8>>(self.chunk_capacity);
        let synth = self.synth.inner();
        let text = text.to_string();
        let voice = voice.clone();
        let provider =
            tokio::spawn(async move { synth.synthesize(&text, &voice, chunk_tx).await });

        let mut completed = true;
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    completed = false;
                    break;
                }
                maybe_chunk = chunk_rx.recv() => {
                    match maybe_chunk {
                        Some(chunk) => {
                            if self.audio_out.send(chunk).await.is_err() {
                                completed = false;
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        }
        // Dropping the receiver discards buffered-but-unsent synthesis
        // and tells the provider task to stop.
        drop(chunk_rx);

        self.shared.state.send_if_modified(|state| {
            if *state == PipelineState::Speaking {
                *state = PipelineState::Listening;
                true
            } else {
                false
            }
        });

        if completed {
            match provider.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(e),
                Err(e) => return Err(SwitchboardError::Other(anyhow::Error::new(e))),
            }
        } else {
            provider.abort();
        }
        Ok(completed)
    }

    /// Cancel whatever is currently playing, if anything. Used by agent
    /// switches so the outgoing agent's audio stops before the incoming
    /// agent speaks.
    pub async fn cancel_current(&self) {
        self.shared.cancel_speaking().await;
    }

    pub fn state(&self) -> PipelineState {
        self.shared.state()
    }
}

/// Inbound task state: byte-to-frame assembly, VAD, recognizer feed.
struct InboundTask {
    config: PipelineConfig,
    shared: Arc<Shared>,
    vad: VoiceActivityDetector,
    /// Dangling byte from an odd-length transport read.
    pending_byte: Option<u8>,
    samples: Vec<i16>,
    /// Recent non-speech frames, replayed when speech starts so the
    /// debounce does not clip the utterance onset.
    preroll: VecDeque<Vec<i16>>,
    preroll_capacity: usize,
    stt: PoolResource<Box<dyn SpeechRecognizer>>,
    stt_pool: Arc<RecognizerPool>,
    tts_pool: Arc<SynthesizerPool>,
}

impl InboundTask {
    async fn run(
        mut self,
        mut audio_rx: mpsc::Receiver<Vec<u8>>,
        mut stream: RecognizerStream,
        events: mpsc::Sender<PipelineEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                maybe_bytes = audio_rx.recv() => {
                    let Some(bytes) = maybe_bytes else { break };
                    self.ingest(&bytes, &stream.frames, &events).await;
                }
                maybe_transcript = stream.transcripts.recv() => {
                    let Some(transcript) = maybe_transcript else {
                        warn!(session = %self.shared.session_id, "Recognizer stream died");
                        break;
                    };
                    let event = if transcript.is_final {
                        self.shared.state.send_if_modified(|state| {
                            if *state == PipelineState::Listening {
                                *state = PipelineState::Waiting;
                                true
                            } else {
                                false
                            }
                        });
                        PipelineEvent::UtteranceComplete { transcript: transcript.text }
                    } else {
                        PipelineEvent::PartialTranscript { text: transcript.text }
                    };
                    if events.send(event).await.is_err() {
                        break;
                    }
                }
            }
        }
        self.shutdown(&events).await;
    }

    async fn ingest(
        &mut self,
        bytes: &[u8],
        frames: &mpsc::Sender<FrameSignal>,
        events: &mpsc::Sender<PipelineEvent>,
    ) {
        self.decode_bytes(bytes);
        let frame_len = self.config.frame_samples();
        while self.samples.len() >= frame_len {
            let frame: Vec<i16> = self.samples.drain(..frame_len).collect();
            self.process_frame(frame, frames, events).await;
        }
    }

    fn decode_bytes(&mut self, mut bytes: &[u8]) {
        if let Some(first) = self.pending_byte.take() {
            match bytes.split_first() {
                Some((&second, rest)) => {
                    self.samples.push(i16::from_le_bytes([first, second]));
                    bytes = rest;
                }
                None => {
                    self.pending_byte = Some(first);
                    return;
                }
            }
        }
        let mut pairs = bytes.chunks_exact(2);
        for pair in &mut pairs {
            self.samples.push(i16::from_le_bytes([pair[0], pair[1]]));
        }
        if let [odd] = pairs.remainder() {
            self.pending_byte = Some(*odd);
        }
    }

    async fn process_frame(
        &mut self,
        frame: Vec<i16>,
        frames: &mpsc::Sender<FrameSignal>,
        events: &mpsc::Sender<PipelineEvent>,
    ) {
        let speaking = self.shared.state() == PipelineState::Speaking;
        self.vad.set_min_speech_frames(if speaking {
            self.config.barge_in_min_speech_frames
        } else {
            1
        });

        match self.vad.process_frame(&frame) {
            Some(VadEvent::SpeechStarted) => {
                if speaking {
                    // Interrupt playback before anything else so the line
                    // goes quiet within this frame window.
                    self.shared.cancel_speaking().await;
                    self.shared.state.send_replace(PipelineState::Listening);
                    debug!(session = %self.shared.session_id, "Barge-in; outbound audio cancelled");
                    let _ = events.send(PipelineEvent::BargeIn).await;
                }
                for buffered in self.preroll.drain(..) {
                    let _ = frames.send(FrameSignal::Pcm(buffered)).await;
                }
                let _ = frames.send(FrameSignal::Pcm(frame)).await;
            }
            Some(VadEvent::UtteranceEnded) => {
                let _ = frames.send(FrameSignal::EndOfUtterance).await;
            }
            None => {
                if self.vad.is_active() {
                    let _ = frames.send(FrameSignal::Pcm(frame)).await;
                } else {
                    if self.preroll.len() >= self.preroll_capacity {
                        self.preroll.pop_front();
                    }
                    self.preroll.push_back(frame);
                }
            }
        }
    }

    async fn shutdown(self, events: &mpsc::Sender<PipelineEvent>) {
        self.shared.cancel_speaking().await;
        self.shared.state.send_replace(PipelineState::Closed);
        let _ = events.send(PipelineEvent::Closed).await;
        drop(self.stt);
        self.stt_pool
            .release_for_session(&self.shared.session_id)
            .await;
        self.tts_pool
            .release_for_session(&self.shared.session_id)
            .await;
        info!(session = %self.shared.session_id, "Speech pipeline closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recognizer::TranscriptEvent;
    use async_trait::async_trait;
    use std::time::Instant;
    use switchboard_core::config::PoolSettings;
    use switchboard_pool::ResourceFactory;
    use tokio::time::timeout;

    struct ScriptedRecognizer {
        replies: Arc<Mutex<VecDeque<String>>>,
    }

    #[async_trait]
    impl SpeechRecognizer for ScriptedRecognizer {
        async fn start(&self, _session_id: &str) -> Result<RecognizerStream> {
            let (frame_tx, mut frame_rx) = mpsc::channel(64);
            let (transcript_tx, transcript_rx) = mpsc::channel(8);
            let replies = Arc::clone(&self.replies);
            tokio::spawn(async move {
                let mut saw_audio = false;
                while let Some(signal) = frame_rx.recv().await {
                    match signal {
                        FrameSignal::Pcm(_) => saw_audio = true,
                        FrameSignal::EndOfUtterance => {
                            if !saw_audio {
                                continue;
                            }
                            saw_audio = false;
                            let text = replies
                                .lock()
                                .await
                                .pop_front()
                                .unwrap_or_else(|| "mm-hmm".to_string());
                            let event = TranscriptEvent {
                                text,
                                is_final: true,
                            };
                            if transcript_tx.send(event).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
            Ok(RecognizerStream {
                frames: frame_tx,
                transcripts: transcript_rx,
            })
        }
    }

    struct ScriptedRecognizerFactory {
        replies: Arc<Mutex<VecDeque<String>>>,
    }

    #[async_trait]
    impl ResourceFactory<Box<dyn SpeechRecognizer>> for ScriptedRecognizerFactory {
        async fn create(&self) -> anyhow::Result<Box<dyn SpeechRecognizer>> {
            Ok(Box::new(ScriptedRecognizer {
                replies: Arc::clone(&self.replies),
            }))
        }
    }

    /// Emits `chunks` PCM chunks with a pause between each, so a test can
    /// interrupt mid-stream.
    struct PacedSynthesizer {
        chunks: usize,
        gap: Duration,
    }

    #[async_trait]
    impl SpeechSynthesizer for PacedSynthesizer {
        async fn synthesize(
            &self,
            _text: &str,
            _voice: &VoiceConfig,
            chunk_tx: mpsc::Sender<Vec<u8>>,
        ) -> Result<()> {
            for _ in 0..self.chunks {
                if chunk_tx.send(vec![0u8; 640]).await.is_err() {
                    break;
                }
                if !self.gap.is_zero() {
                    tokio::time::sleep(self.gap).await;
                }
            }
            Ok(())
        }
    }

    struct PacedSynthesizerFactory {
        chunks: usize,
        gap: Duration,
    }

    #[async_trait]
    impl ResourceFactory<Box<dyn SpeechSynthesizer>> for PacedSynthesizerFactory {
        async fn create(&self) -> anyhow::Result<Box<dyn SpeechSynthesizer>> {
            Ok(Box::new(PacedSynthesizer {
                chunks: self.chunks,
                gap: self.gap,
            }))
        }
    }

    fn test_config() -> PipelineConfig {
        PipelineConfig {
            sample_rate: 16_000,
            vad_threshold: 100.0,
            min_silence_frames: 3,
            barge_in_min_speech_frames: 2,
            frame_capacity: 64,
        }
    }

    fn pool_settings() -> PoolSettings {
        PoolSettings {
            target_warm: 0,
            max_age_secs: 300,
            refresh_interval_secs: 30,
            acquire_timeout_ms: 1_000,
        }
    }

    fn loud_frame() -> Vec<u8> {
        vec![900i16; 320].iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    fn quiet_frame() -> Vec<u8> {
        vec![0u8; 640]
    }

    async fn start_pipeline(
        replies: &[&str],
        synth_chunks: usize,
        synth_gap: Duration,
    ) -> (
        PipelineHandle,
        mpsc::Receiver<PipelineEvent>,
        mpsc::Receiver<Vec<u8>>,
        Arc<RecognizerPool>,
        Arc<SynthesizerPool>,
    ) {
        let replies: VecDeque<String> = replies.iter().map(|s| s.to_string()).collect();
        let stt_pool: Arc<RecognizerPool> = ResourcePool::new(
            "stt",
            pool_settings(),
            Arc::new(ScriptedRecognizerFactory {
                replies: Arc::new(Mutex::new(replies)),
            }),
        );
        let tts_pool: Arc<SynthesizerPool> = ResourcePool::new(
            "tts",
            pool_settings(),
            Arc::new(PacedSynthesizerFactory {
                chunks: synth_chunks,
                gap: synth_gap,
            }),
        );
        let (audio_out_tx, audio_out_rx) = mpsc::channel(256);
        let (handle, events) = SpeechPipelineCoordinator::start(
            "session-1",
            test_config(),
            Arc::clone(&stt_pool),
            Arc::clone(&tts_pool),
            audio_out_tx,
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        (handle, events, audio_out_rx, stt_pool, tts_pool)
    }

    #[tokio::test]
    async fn utterance_is_segmented_and_transcribed() {
        let (handle, mut events, _audio_out, _stt, _tts) =
            start_pipeline(&["I need to report fraud"], 0, Duration::ZERO).await;
        assert_eq!(handle.state(), PipelineState::Listening);

        let audio = handle.audio_sender();
        for _ in 0..5 {
            audio.send(loud_frame()).await.unwrap();
        }
        for _ in 0..4 {
            audio.send(quiet_frame()).await.unwrap();
        }

        let event = timeout(Duration::from_secs(1), events.recv())
            .await
            .expect("utterance should arrive")
            .unwrap();
        assert_eq!(
            event,
            PipelineEvent::UtteranceComplete {
                transcript: "I need to report fraud".to_string()
            }
        );
        assert_eq!(handle.state(), PipelineState::Waiting);
    }

    #[tokio::test]
    async fn frames_survive_odd_transport_chunking() {
        let (handle, mut events, _audio_out, _stt, _tts) =
            start_pipeline(&["chopped"], 0, Duration::ZERO).await;

        // 5 loud frames then 4 quiet ones, replayed in 641-byte slices so
        // every push splits a sample in half.
        let mut all: Vec<u8> = Vec::new();
        for _ in 0..5 {
            all.extend(loud_frame());
        }
        for _ in 0..4 {
            all.extend(quiet_frame());
        }
        let audio = handle.audio_sender();
        for slice in all.chunks(641) {
            audio.send(slice.to_vec()).await.unwrap();
        }

        let event = timeout(Duration::from_secs(1), events.recv())
            .await
            .expect("utterance should survive re-chunking")
            .unwrap();
        assert_eq!(
            event,
            PipelineEvent::UtteranceComplete {
                transcript: "chopped".to_string()
            }
        );
    }

    #[tokio::test]
    async fn speak_delivers_all_chunks() {
        let (handle, _events, mut audio_out, _stt, _tts) =
            start_pipeline(&[], 3, Duration::ZERO).await;

        let completed = handle
            .speaker()
            .speak("hello there", &VoiceConfig::default())
            .await
            .unwrap();
        assert!(completed);
        assert_eq!(handle.state(), PipelineState::Listening);

        let mut received = 0;
        while let Ok(Some(_)) = timeout(Duration::from_millis(100), audio_out.recv()).await {
            received += 1;
        }
        assert_eq!(received, 3);
    }

    #[tokio::test]
    async fn barge_in_cancels_playback_within_the_frame_budget() {
        let (handle, mut events, mut audio_out, _stt, _tts) =
            start_pipeline(&[], 500, Duration::from_millis(5)).await;

        let speaker = handle.speaker();
        let speak_task =
            tokio::spawn(async move { speaker.speak("a very long monologue", &VoiceConfig::default()).await });

        // Wait until playback is demonstrably under way.
        let first = timeout(Duration::from_secs(1), audio_out.recv()).await.unwrap();
        assert!(first.is_some());
        assert_eq!(handle.state(), PipelineState::Speaking);

        // Two consecutive speech frames cross the barge-in debounce.
        let audio = handle.audio_sender();
        let trigger = Instant::now();
        audio.send(loud_frame()).await.unwrap();
        audio.send(loud_frame()).await.unwrap();

        let event = timeout(Duration::from_millis(500), events.recv())
            .await
            .expect("barge-in should be signalled promptly")
            .unwrap();
        assert_eq!(event, PipelineEvent::BargeIn);

        let completed = timeout(Duration::from_secs(1), speak_task)
            .await
            .expect("speak should unwind after cancellation")
            .unwrap()
            .unwrap();
        assert!(!completed, "interrupted playback must not report success");
        assert!(
            trigger.elapsed() < Duration::from_millis(250),
            "cancellation took {:?}",
            trigger.elapsed()
        );
        assert_eq!(handle.state(), PipelineState::Listening);
    }

    #[tokio::test]
    async fn close_releases_pooled_resources() {
        let (handle, mut events, _audio_out, stt_pool, tts_pool) =
            start_pipeline(&[], 0, Duration::ZERO).await;
        assert_eq!(stt_pool.snapshot().await.dedicated_count, 1);
        assert_eq!(tts_pool.snapshot().await.dedicated_count, 1);

        handle.close();
        loop {
            let event = timeout(Duration::from_secs(1), events.recv())
                .await
                .expect("closed event should arrive")
                .unwrap();
            if event == PipelineEvent::Closed {
                break;
            }
        }
        assert_eq!(handle.state(), PipelineState::Closed);
        assert_eq!(stt_pool.snapshot().await.dedicated_count, 0);
        assert_eq!(tts_pool.snapshot().await.dedicated_count, 0);
    }

    #[tokio::test]
    async fn speak_after_close_is_an_error() {
        let (handle, mut events, _audio_out, _stt, _tts) =
            start_pipeline(&[], 3, Duration::ZERO).await;
        handle.close();
        loop {
            let event = timeout(Duration::from_secs(1), events.recv())
                .await
                .unwrap()
                .unwrap();
            if event == PipelineEvent::Closed {
                break;
            }
        }

        let err = handle
            .speaker()
            .speak("too late", &VoiceConfig::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "session");
    }
}
