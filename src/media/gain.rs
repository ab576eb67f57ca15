/// RMS the gain stage steers towards
const TARGET_RMS: f32 = 0.1;
/// Frames quieter than this are treated as silence and left alone
const NOISE_FLOOR_RMS: f32 = 0.002;
const MIN_GAIN: f32 = 0.25;
const MAX_GAIN: f32 = 8.0;
/// Fraction of the distance to the desired gain covered per frame
const ADAPT_RATE: f32 = 0.05;

/// Slow automatic gain control for voice frames
#[derive(Debug, Clone)]
pub struct AutoGain {
    gain: f32,
}

impl Default for AutoGain {
    fn default() -> Self {
        Self::new()
    }
}

impl AutoGain {
    pub fn new() -> Self {
        Self { gain: 1.0 }
    }

    pub fn gain(&self) -> f32 {
        self.gain
    }

    pub fn process(&mut self, samples: &mut [f32]) {
        if samples.is_empty() {
            return;
        }
        let rms = (samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32).sqrt();
        if rms > NOISE_FLOOR_RMS {
            let desired = (TARGET_RMS / rms).clamp(MIN_GAIN, MAX_GAIN);
            self.gain += (desired - self.gain) * ADAPT_RATE;
        }
        for sample in samples.iter_mut() {
            *sample = (*sample * self.gain).clamp(-1.0, 1.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quiet_voice_is_boosted() {
        let mut agc = AutoGain::new();
        for _ in 0..200 {
            let mut frame = vec![0.01f32; 960];
            agc.process(&mut frame);
        }
        assert!(agc.gain() > 4.0);
    }

    #[test]
    fn test_loud_voice_is_attenuated() {
        let mut agc = AutoGain::new();
        for _ in 0..200 {
            let mut frame = vec![0.8f32; 960];
            agc.process(&mut frame);
            assert!(frame.iter().all(|s| s.abs() <= 1.0));
        }
        assert!(agc.gain() < 1.0);
    }

    #[test]
    fn test_silence_does_not_move_gain() {
        let mut agc = AutoGain::new();
        let mut frame = vec![0.0f32; 960];
        agc.process(&mut frame);
        assert_eq!(agc.gain(), 1.0);
    }
}
