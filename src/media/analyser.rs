//! Byte-scaled frequency analysis of the most recent audio samples.
//!
//! Matches the behaviour of a browser analyser node: a Blackman window over
//! the last `fft_size` samples, FFT, magnitude normalised by the window
//! length, exponential smoothing over time, conversion to decibels, then a
//! linear map of `[min_decibels, max_decibels]` onto `0..=255`.

use ringbuf::traits::{Consumer, Observer, RingBuffer};
use ringbuf::HeapRb;
use rustfft::{num_complex::Complex, Fft, FftPlanner};
use std::f32::consts::PI;
use std::sync::Arc;

use crate::config::SpeakingConfig;

pub struct FrequencyAnalyser {
    fft_size: usize,
    smoothing: f32,
    min_decibels: f32,
    max_decibels: f32,
    history: HeapRb<f32>,
    window: Vec<f32>,
    smoothed: Vec<f32>,
    fft: Arc<dyn Fft<f32>>,
}

impl FrequencyAnalyser {
    pub fn new(config: &SpeakingConfig) -> Self {
        let fft_size = config.fft_size;
        let fft = FftPlanner::new().plan_fft_forward(fft_size);

        Self {
            fft_size,
            smoothing: config.smoothing,
            min_decibels: config.min_decibels,
            max_decibels: config.max_decibels,
            history: HeapRb::new(fft_size),
            window: blackman_window(fft_size),
            smoothed: vec![0.0; fft_size / 2],
            fft,
        }
    }

    pub fn fft_size(&self) -> usize {
        self.fft_size
    }

    pub fn frequency_bin_count(&self) -> usize {
        self.fft_size / 2
    }

    /// Append time-domain samples; only the latest `fft_size` are kept
    pub fn push_samples(&mut self, samples: &[f32]) {
        for &sample in samples {
            self.history.push_overwrite(sample);
        }
    }

    /// Compute the current spectrum, one byte per bin. Advances the smoothing state.
    pub fn byte_frequency_data(&mut self) -> Vec<u8> {
        let missing = self.fft_size - self.history.occupied_len();
        let mut buffer: Vec<Complex<f32>> = std::iter::repeat(0.0f32)
            .take(missing)
            .chain(self.history.iter().copied())
            .zip(self.window.iter())
            .map(|(sample, w)| Complex::new(sample * w, 0.0))
            .collect();

        self.fft.process(&mut buffer);

        let norm = 1.0 / self.fft_size as f32;
        let range = self.max_decibels - self.min_decibels;
        let tau = self.smoothing;

        self.smoothed
            .iter_mut()
            .zip(buffer.iter())
            .map(|(previous, bin)| {
                let magnitude = bin.norm() * norm;
                let mut value = tau * *previous + (1.0 - tau) * magnitude;
                if !value.is_finite() {
                    value = 0.0;
                }
                *previous = value;

                if value <= 0.0 {
                    return 0u8;
                }
                let db = 20.0 * value.log10();
                let scaled = (255.0 / range) * (db - self.min_decibels);
                scaled.floor().clamp(0.0, 255.0) as u8
            })
            .collect()
    }

    /// Arithmetic mean of the byte spectrum
    pub fn mean_energy(&mut self) -> f32 {
        let data = self.byte_frequency_data();
        if data.is_empty() {
            return 0.0;
        }
        data.iter().map(|&b| b as f32).sum::<f32>() / data.len() as f32
    }

    pub fn reset(&mut self) {
        self.history = HeapRb::new(self.fft_size);
        self.smoothed.iter_mut().for_each(|v| *v = 0.0);
    }
}

fn blackman_window(size: usize) -> Vec<f32> {
    const A0: f32 = 0.42;
    const A1: f32 = 0.5;
    const A2: f32 = 0.08;
    (0..size)
        .map(|n| {
            let x = n as f32 / size as f32;
            A0 - A1 * (2.0 * PI * x).cos() + A2 * (4.0 * PI * x).cos()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn noise(amplitude: f32, len: usize, seed: u64) -> Vec<f32> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..len).map(|_| rng.gen_range(-amplitude..amplitude)).collect()
    }

    #[test]
    fn test_bin_count_is_half_fft_size() {
        let analyser = FrequencyAnalyser::new(&SpeakingConfig::default());
        assert_eq!(analyser.frequency_bin_count(), 128);
    }

    #[test]
    fn test_silence_is_zero_energy() {
        let mut analyser = FrequencyAnalyser::new(&SpeakingConfig::default());
        analyser.push_samples(&vec![0.0; 960]);
        let data = analyser.byte_frequency_data();
        assert_eq!(data.len(), 128);
        assert!(data.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_loud_noise_exceeds_threshold() {
        let mut analyser = FrequencyAnalyser::new(&SpeakingConfig::default());
        analyser.push_samples(&noise(0.5, 960, 7));
        assert!(analyser.mean_energy() > 15.0);
    }

    #[test]
    fn test_faint_noise_stays_below_threshold() {
        let mut analyser = FrequencyAnalyser::new(&SpeakingConfig::default());
        analyser.push_samples(&noise(1e-4, 960, 11));
        assert!(analyser.mean_energy() < 15.0);
    }

    #[test]
    fn test_smoothing_decays_gradually() {
        let mut analyser = FrequencyAnalyser::new(&SpeakingConfig::default());
        analyser.push_samples(&noise(0.5, 960, 3));
        let loud = analyser.mean_energy();

        analyser.push_samples(&vec![0.0; 960]);
        let first_silent = analyser.mean_energy();
        let second_silent = analyser.mean_energy();

        assert!(first_silent > 0.0);
        assert!(first_silent < loud);
        assert!(second_silent < first_silent);
    }

    #[test]
    fn test_reset_clears_history() {
        let mut analyser = FrequencyAnalyser::new(&SpeakingConfig::default());
        analyser.push_samples(&noise(0.5, 960, 5));
        analyser.mean_energy();
        analyser.reset();
        assert_eq!(analyser.mean_energy(), 0.0);
    }

    #[test]
    fn test_blackman_window_shape() {
        let window = blackman_window(256);
        assert!(window[0].abs() < 1e-6);
        assert!((window[128] - 1.0).abs() < 1e-3);
    }
}
