//! Energy-based voice activity detection over PCM16 frames.

/// Edge emitted by the detector when the speech state flips.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadEvent {
    /// Enough consecutive energetic frames arrived to call it speech.
    SpeechStarted,
    /// Sustained silence after speech; the utterance is over.
    UtteranceEnded,
}

/// RMS-threshold detector with debounce on both edges.
///
/// Speech starts after `min_speech_frames` consecutive frames above the
/// threshold and ends after `min_silence_frames` consecutive frames below
/// it. The start debounce is what separates a real interruption from a
/// cough while playback is running; callers raise it while audio is being
/// emitted and drop it back to 1 when plainly listening.
pub struct VoiceActivityDetector {
    threshold: f64,
    min_speech_frames: usize,
    min_silence_frames: usize,
    speech_active: bool,
    speech_run: usize,
    silence_run: usize,
}

impl VoiceActivityDetector {
    pub fn new(threshold: f64, min_speech_frames: usize, min_silence_frames: usize) -> Self {
        Self {
            threshold,
            min_speech_frames: min_speech_frames.max(1),
            min_silence_frames: min_silence_frames.max(1),
            speech_active: false,
            speech_run: 0,
            silence_run: 0,
        }
    }

    /// RMS energy of one frame.
    pub fn rms(samples: &[i16]) -> f64 {
        if samples.is_empty() {
            return 0.0;
        }
        let sum: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
        (sum / samples.len() as f64).sqrt()
    }

    /// Classify one frame and report a state edge, if any.
    pub fn process_frame(&mut self, pcm: &[i16]) -> Option<VadEvent> {
        let energetic = Self::rms(pcm) > self.threshold;

        if energetic {
            self.silence_run = 0;
            self.speech_run += 1;
            if !self.speech_active && self.speech_run >= self.min_speech_frames {
                self.speech_active = true;
                return Some(VadEvent::SpeechStarted);
            }
        } else {
            self.speech_run = 0;
            if self.speech_active {
                self.silence_run += 1;
                if self.silence_run >= self.min_silence_frames {
                    self.speech_active = false;
                    self.silence_run = 0;
                    return Some(VadEvent::UtteranceEnded);
                }
            }
        }

        None
    }

    pub fn is_active(&self) -> bool {
        self.speech_active
    }

    /// Adjust the start debounce without disturbing an utterance in
    /// progress. Takes effect on the next start edge.
    pub fn set_min_speech_frames(&mut self, frames: usize) {
        self.min_speech_frames = frames.max(1);
    }

    pub fn reset(&mut self) {
        self.speech_active = false;
        self.speech_run = 0;
        self.silence_run = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loud(n: usize) -> Vec<i16> {
        vec![900i16; n]
    }

    fn quiet(n: usize) -> Vec<i16> {
        vec![0i16; n]
    }

    #[test]
    fn rms_of_known_signals() {
        assert_eq!(VoiceActivityDetector::rms(&quiet(320)), 0.0);
        assert_eq!(VoiceActivityDetector::rms(&[]), 0.0);
        let rms = VoiceActivityDetector::rms(&vec![200i16; 320]);
        assert!((rms - 200.0).abs() < 0.01);
    }

    #[test]
    fn start_and_end_edges_fire_once() {
        let mut vad = VoiceActivityDetector::new(100.0, 1, 3);

        assert_eq!(vad.process_frame(&quiet(320)), None);
        assert_eq!(
            vad.process_frame(&loud(320)),
            Some(VadEvent::SpeechStarted)
        );
        assert_eq!(vad.process_frame(&loud(320)), None);

        assert_eq!(vad.process_frame(&quiet(320)), None);
        assert_eq!(vad.process_frame(&quiet(320)), None);
        assert_eq!(
            vad.process_frame(&quiet(320)),
            Some(VadEvent::UtteranceEnded)
        );
        assert!(!vad.is_active());
    }

    #[test]
    fn start_debounce_blocks_short_bursts() {
        let mut vad = VoiceActivityDetector::new(100.0, 3, 3);

        // Two loud frames, then silence: never counted as speech.
        assert_eq!(vad.process_frame(&loud(320)), None);
        assert_eq!(vad.process_frame(&loud(320)), None);
        assert_eq!(vad.process_frame(&quiet(320)), None);
        assert!(!vad.is_active());

        // Three in a row crosses the debounce.
        assert_eq!(vad.process_frame(&loud(320)), None);
        assert_eq!(vad.process_frame(&loud(320)), None);
        assert_eq!(
            vad.process_frame(&loud(320)),
            Some(VadEvent::SpeechStarted)
        );
    }

    #[test]
    fn silence_inside_speech_does_not_end_utterance() {
        let mut vad = VoiceActivityDetector::new(100.0, 1, 3);
        vad.process_frame(&loud(320));

        // A two-frame pause, shorter than the end debounce.
        assert_eq!(vad.process_frame(&quiet(320)), None);
        assert_eq!(vad.process_frame(&quiet(320)), None);
        assert_eq!(vad.process_frame(&loud(320)), None);
        assert!(vad.is_active());
    }

    #[test]
    fn reset_clears_state() {
        let mut vad = VoiceActivityDetector::new(100.0, 1, 3);
        vad.process_frame(&loud(320));
        assert!(vad.is_active());
        vad.reset();
        assert!(!vad.is_active());
        assert_eq!(vad.process_frame(&quiet(320)), None);
    }
}
