mod analyser;
mod capture;
mod cpal_device;
mod denoise;
mod encoder;
mod gain;
mod memory;
mod speaking;
mod track;

pub use analyser::FrequencyAnalyser;
pub use capture::CaptureManager;
pub use cpal_device::CpalMediaDevices;
pub use encoder::{CodecError, VoiceDecoder, VoiceEncoder};
pub use memory::MemoryMediaDevices;
pub use speaking::{speaking_gate, SpeakingDetector};
pub use track::{AudioFrame, MediaStream, MediaStreamTrack, TrackKind, WeakMediaStreamTrack};

use async_trait::async_trait;

use crate::config::AudioConstraints;
use crate::error::DeviceAccessError;

/// Sample rate of every published frame (48kHz is Opus native)
pub const SAMPLE_RATE: u32 = 48000;
/// Channels (mono for voice)
pub const CHANNELS: u16 = 1;
/// Frame duration in ms (20ms is optimal for Opus)
pub const FRAME_DURATION_MS: u32 = 20;
/// Samples per frame (48000 * 20 / 1000 = 960)
pub const SAMPLES_PER_FRAME: usize = (SAMPLE_RATE * FRAME_DURATION_MS / 1000) as usize;
/// Opus target for one mono voice, with room left for in-band FEC
pub const OPUS_BITRATE: i32 = 32000;

/// Platform capability that opens audio input devices.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Open an audio-only input stream honouring `constraints`.
    ///
    /// May wait indefinitely while the platform prompts for permission.
    async fn get_user_media(
        &self,
        constraints: &AudioConstraints,
    ) -> Result<MediaStream, DeviceAccessError>;
}

/// Linear resample of mono samples between two rates
pub(crate) fn resample_linear(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || samples.is_empty() {
        return samples.to_vec();
    }

    let ratio = to_rate as f64 / from_rate as f64;
    let output_len = (samples.len() as f64 * ratio).round() as usize;
    let last = samples.len() - 1;
    let mut output = Vec::with_capacity(output_len);

    for i in 0..output_len {
        let src_idx = i as f64 / ratio;
        let idx_floor = (src_idx.floor() as usize).min(last);
        let idx_ceil = (idx_floor + 1).min(last);
        let frac = (src_idx - idx_floor as f64) as f32;

        let s1 = samples[idx_floor];
        let s2 = samples[idx_ceil];
        output.push(s1 + (s2 - s1) * frac);
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resample_identity() {
        let samples = vec![0.1, 0.2, 0.3];
        assert_eq!(resample_linear(&samples, 48000, 48000), samples);
    }

    #[test]
    fn test_resample_upsamples_length() {
        let samples = vec![0.0f32; 441];
        let out = resample_linear(&samples, 44100, 48000);
        assert_eq!(out.len(), 480);
    }

    #[test]
    fn test_resample_downsamples_length() {
        let samples = vec![0.5f32; 960];
        let out = resample_linear(&samples, 48000, 16000);
        assert_eq!(out.len(), 320);
        assert!(out.iter().all(|s| (*s - 0.5).abs() < 1e-6));
    }
}
