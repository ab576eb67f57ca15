//! Noise suppression using nnnoiseless (RNNoise-based)

use nnnoiseless::DenoiseState;

/// Frame size required by nnnoiseless (480 samples at 48kHz = 10ms)
const DENOISE_FRAME_SIZE: usize = 480;

/// RNNoise works on 16-bit PCM magnitudes rather than [-1, 1]
const PCM_SCALE: f32 = i16::MAX as f32;

/// Streaming denoiser over 48kHz mono samples.
///
/// Output lags input by whatever is left over from the last partial frame.
pub struct Denoiser {
    state: Box<DenoiseState<'static>>,
    input_buffer: Vec<f32>,
}

impl Denoiser {
    pub fn new() -> Self {
        Self {
            state: DenoiseState::new(),
            input_buffer: Vec::with_capacity(DENOISE_FRAME_SIZE * 4),
        }
    }

    /// Process samples, returning every complete denoised frame so far
    pub fn process(&mut self, samples: &[f32]) -> Vec<f32> {
        self.input_buffer.extend_from_slice(samples);

        let complete = self.input_buffer.len() / DENOISE_FRAME_SIZE * DENOISE_FRAME_SIZE;
        let mut output = Vec::with_capacity(complete);
        let mut input_frame = [0.0f32; DENOISE_FRAME_SIZE];
        let mut output_frame = [0.0f32; DENOISE_FRAME_SIZE];

        for chunk in self.input_buffer[..complete].chunks_exact(DENOISE_FRAME_SIZE) {
            for (dst, src) in input_frame.iter_mut().zip(chunk) {
                *dst = src * PCM_SCALE;
            }
            self.state.process_frame(&mut output_frame, &input_frame);
            output.extend(output_frame.iter().map(|s| (s / PCM_SCALE).clamp(-1.0, 1.0)));
        }

        self.input_buffer.drain(..complete);
        output
    }

    pub fn reset(&mut self) {
        self.state = DenoiseState::new();
        self.input_buffer.clear();
    }
}

impl Default for Denoiser {
    fn default() -> Self {
        Self::new()
    }
}
