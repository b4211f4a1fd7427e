//! Audio-side building blocks: VAD, speech provider traits, and the
//! per-session pipeline that ties them to the resource pools.

pub mod pipeline;
pub mod recognizer;
pub mod synthesizer;
pub mod vad;

pub use pipeline::{
    PipelineEvent, PipelineHandle, PipelineState, RecognizerPool, Speaker,
    SpeechPipelineCoordinator, SynthesizerPool,
};
pub use recognizer::{FrameSignal, RecognizerStream, SpeechRecognizer, TranscriptEvent};
pub use synthesizer::SpeechSynthesizer;
