//! Energy-based voice activity detection with hysteresis.

/// Analysis window length
pub const WINDOW_MS: u32 = 30;

/// Release threshold as a fraction of the onset threshold
pub const DEFAULT_RELEASE_RATIO: f32 = 0.5;

/// RMS of a block of i16 samples, in i16 amplitude units
pub fn rms(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f64 = samples.iter().map(|&s| f64::from(s) * f64::from(s)).sum();
    (sum_sq / samples.len() as f64).sqrt() as f32
}

/// Classifies frames as voiced or silent.
///
/// Each frame is split into 30 ms windows. A window turns the detector on when
/// its RMS reaches `threshold`; once on, it stays on until a window drops below
/// `threshold * release_ratio`. The lower release level avoids chatter when the
/// signal hovers near the threshold.
#[derive(Debug, Clone)]
pub struct VoiceActivityDetector {
    threshold: f32,
    release_ratio: f32,
    voiced: bool,
}

impl VoiceActivityDetector {
    pub fn new(threshold: f32) -> Self {
        Self::with_release_ratio(threshold, DEFAULT_RELEASE_RATIO)
    }

    pub fn with_release_ratio(threshold: f32, release_ratio: f32) -> Self {
        Self {
            threshold,
            release_ratio: release_ratio.clamp(0.0, 1.0),
            voiced: false,
        }
    }

    /// Returns true if any window in the frame was voiced
    pub fn process(&mut self, frame: &[i16], sample_rate: u32) -> bool {
        let window = ((sample_rate * WINDOW_MS) / 1000).max(1) as usize;
        let mut any_voiced = false;

        for chunk in frame.chunks(window) {
            let level = rms(chunk);
            let limit = if self.voiced {
                self.threshold * self.release_ratio
            } else {
                self.threshold
            };
            self.voiced = level >= limit;
            any_voiced |= self.voiced;
        }

        any_voiced
    }

    /// Current hysteresis state
    pub fn is_voiced(&self) -> bool {
        self.voiced
    }

    pub fn reset(&mut self) {
        self.voiced = false;
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square(amplitude: i16, len: usize) -> Vec<i16> {
        (0..len)
            .map(|i| if i % 2 == 0 { amplitude } else { -amplitude })
            .collect()
    }

    #[test]
    fn rms_of_square_wave_is_amplitude() {
        assert!((rms(&square(1000, 480)) - 1000.0).abs() < 0.01);
        assert_eq!(rms(&[]), 0.0);
    }

    #[test]
    fn silence_is_not_voiced() {
        let mut vad = VoiceActivityDetector::new(500.0);
        assert!(!vad.process(&vec![0i16; 1440], 16000));
    }

    #[test]
    fn hysteresis_holds_between_release_and_onset() {
        let mut vad = VoiceActivityDetector::new(500.0);

        // Below onset: stays off
        assert!(!vad.process(&square(400, 480), 16000));

        // Onset
        assert!(vad.process(&square(600, 480), 16000));

        // Between release (250) and onset (500): stays on
        assert!(vad.process(&square(400, 480), 16000));

        // Below release: off
        assert!(!vad.process(&square(200, 480), 16000));
        assert!(!vad.is_voiced());
    }

    #[test]
    fn any_voiced_window_marks_frame() {
        let mut vad = VoiceActivityDetector::new(500.0);
        let mut frame = vec![0i16; 960];
        frame.extend(square(800, 480));
        assert!(vad.process(&frame, 16000));
    }
}
