//! Microphone access through cpal.
//!
//! Each acquisition spawns a capture thread that owns the `cpal::Stream`
//! (streams are not `Send` on every platform). Stopping the returned track
//! signals that thread, which drops the stream and closes the device.

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BuildStreamError, Device, Host, SampleFormat};
use std::sync::mpsc;
use tokio::sync::oneshot;

use super::denoise::Denoiser;
use super::gain::AutoGain;
use super::{resample_linear, MediaDevices, MediaStream, MediaStreamTrack, SAMPLES_PER_FRAME, SAMPLE_RATE};
use crate::config::AudioConstraints;
use crate::error::DeviceAccessError;

type ReadySender = oneshot::Sender<Result<MediaStreamTrack, DeviceAccessError>>;

pub struct CpalMediaDevices {
    input_device: Option<String>,
}

impl CpalMediaDevices {
    /// `input_device` selects a device by name; `None` uses the system default
    pub fn new(input_device: Option<String>) -> Self {
        Self { input_device }
    }

    pub fn list_input_devices() -> Result<Vec<String>, DeviceAccessError> {
        let host = cpal::default_host();
        let devices = host
            .input_devices()
            .map_err(|e| DeviceAccessError::Unavailable(format!("Failed to enumerate input devices: {}", e)))?;

        Ok(devices.filter_map(|d| d.name().ok()).collect())
    }
}

impl Default for CpalMediaDevices {
    fn default() -> Self {
        Self::new(None)
    }
}

#[async_trait]
impl MediaDevices for CpalMediaDevices {
    async fn get_user_media(
        &self,
        constraints: &AudioConstraints,
    ) -> Result<MediaStream, DeviceAccessError> {
        if constraints.echo_cancellation {
            tracing::warn!("Echo cancellation is not available on the cpal backend, ignoring");
        }

        let (ready_tx, ready_rx) = oneshot::channel();
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let device_name = self.input_device.clone();
        let constraints = *constraints;

        std::thread::Builder::new()
            .name("voxroom-capture".into())
            .spawn(move || run_capture(device_name, constraints, ready_tx, stop_rx))
            .map_err(|e| DeviceAccessError::Unavailable(format!("Failed to spawn capture thread: {}", e)))?;

        let track = ready_rx
            .await
            .map_err(|_| DeviceAccessError::Unavailable("Capture thread exited".into()))??;

        track.set_stop_hook(move || {
            let _ = stop_tx.send(());
        });

        Ok(MediaStream::with_tracks(vec![track]))
    }
}

fn select_device(host: &Host, name: Option<&str>) -> Result<Device, DeviceAccessError> {
    match name {
        Some(device_name) => {
            let devices = host
                .input_devices()
                .map_err(|e| DeviceAccessError::Unavailable(format!("Failed to enumerate devices: {}", e)))?;

            devices
                .into_iter()
                .find(|d| d.name().map(|n| n == device_name).unwrap_or(false))
                .ok_or(DeviceAccessError::NoDevice)
        }
        None => host.default_input_device().ok_or(DeviceAccessError::NoDevice),
    }
}

fn run_capture(
    device_name: Option<String>,
    constraints: AudioConstraints,
    ready: ReadySender,
    stop: mpsc::Receiver<()>,
) {
    let host = cpal::default_host();
    let device = match select_device(&host, device_name.as_deref()) {
        Ok(device) => device,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    let label = device.name().unwrap_or_else(|_| "Microphone".to_string());
    let supported_config = match device.default_input_config() {
        Ok(config) => config,
        Err(e) => {
            let _ = ready.send(Err(DeviceAccessError::Unavailable(format!(
                "Failed to get default input config: {}",
                e
            ))));
            return;
        }
    };

    tracing::info!(
        "Starting capture on {}: {} Hz, {} channels, {:?}",
        label,
        supported_config.sample_rate().0,
        supported_config.channels(),
        supported_config.sample_format()
    );

    let config = supported_config.config();
    let track = MediaStreamTrack::new_audio(label.clone());
    let mut pipeline = CapturePipeline::new(
        config.sample_rate.0,
        config.channels as usize,
        &constraints,
        track.clone(),
    );

    let err_fn = |err| {
        tracing::error!("Audio capture error: {}", err);
    };

    let stream = match supported_config.sample_format() {
        SampleFormat::F32 => device.build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| pipeline.push(data),
            err_fn,
            None,
        ),
        SampleFormat::I16 => device.build_input_stream(
            &config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                let float_data: Vec<f32> = data.iter().map(|&s| s as f32 / i16::MAX as f32).collect();
                pipeline.push(&float_data);
            },
            err_fn,
            None,
        ),
        SampleFormat::U16 => device.build_input_stream(
            &config,
            move |data: &[u16], _: &cpal::InputCallbackInfo| {
                let float_data: Vec<f32> = data
                    .iter()
                    .map(|&s| (s as f32 / u16::MAX as f32) * 2.0 - 1.0)
                    .collect();
                pipeline.push(&float_data);
            },
            err_fn,
            None,
        ),
        format => {
            let _ = ready.send(Err(DeviceAccessError::Unavailable(format!(
                "Unsupported sample format: {:?}",
                format
            ))));
            return;
        }
    };

    let stream = match stream {
        Ok(stream) => stream,
        Err(BuildStreamError::DeviceNotAvailable) => {
            let _ = ready.send(Err(DeviceAccessError::NoDevice));
            return;
        }
        Err(e) => {
            let _ = ready.send(Err(DeviceAccessError::Unavailable(format!(
                "Failed to build input stream: {}",
                e
            ))));
            return;
        }
    };

    if let Err(e) = stream.play() {
        let _ = ready.send(Err(DeviceAccessError::Unavailable(format!(
            "Failed to start audio stream: {}",
            e
        ))));
        return;
    }

    if ready.send(Ok(track)).is_err() {
        tracing::info!("Microphone request abandoned, closing {}", label);
        return;
    }

    // Returns on stop() or once the track and its hook are dropped
    let _ = stop.recv();
    drop(stream);
    tracing::info!("Audio capture on {} stopped", label);
}

/// Turns raw device callbacks into 48kHz mono 20ms frames on a track
struct CapturePipeline {
    source_rate: u32,
    channels: usize,
    denoiser: Option<Denoiser>,
    agc: Option<AutoGain>,
    pending: Vec<f32>,
    track: MediaStreamTrack,
}

impl CapturePipeline {
    fn new(source_rate: u32, channels: usize, constraints: &AudioConstraints, track: MediaStreamTrack) -> Self {
        Self {
            source_rate,
            channels: channels.max(1),
            denoiser: constraints.noise_suppression.then(Denoiser::new),
            agc: constraints.auto_gain_control.then(AutoGain::new),
            pending: Vec::with_capacity(SAMPLES_PER_FRAME * 2),
            track,
        }
    }

    fn push(&mut self, data: &[f32]) {
        let mono: Vec<f32> = if self.channels > 1 {
            data.chunks(self.channels)
                .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
                .collect()
        } else {
            data.to_vec()
        };

        let resampled = resample_linear(&mono, self.source_rate, SAMPLE_RATE);
        match self.denoiser.as_mut() {
            Some(denoiser) => self.pending.extend(denoiser.process(&resampled)),
            None => self.pending.extend(resampled),
        }

        while self.pending.len() >= SAMPLES_PER_FRAME {
            let mut frame: Vec<f32> = self.pending.drain(..SAMPLES_PER_FRAME).collect();
            if let Some(agc) = self.agc.as_mut() {
                agc.process(&mut frame);
            }
            self.track.publish(&frame);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain() -> AudioConstraints {
        AudioConstraints {
            echo_cancellation: false,
            noise_suppression: false,
            auto_gain_control: false,
        }
    }

    #[test]
    fn test_pipeline_frames_stereo_input() {
        let track = MediaStreamTrack::new_audio("test");
        let mut rx = track.subscribe();
        let mut pipeline = CapturePipeline::new(48000, 2, &plain(), track);

        // 30ms of stereo: one full frame plus a remainder
        let data: Vec<f32> = (0..1440 * 2).map(|i| if i % 2 == 0 { 0.2 } else { 0.4 }).collect();
        pipeline.push(&data);

        let frame = rx.try_recv().unwrap();
        assert_eq!(frame.len(), SAMPLES_PER_FRAME);
        assert!(frame.iter().all(|s| (*s - 0.3).abs() < 1e-6));
        assert!(rx.try_recv().is_err());
        assert_eq!(pipeline.pending.len(), 480);
    }

    #[test]
    fn test_pipeline_resamples_to_48k() {
        let track = MediaStreamTrack::new_audio("test");
        let mut rx = track.subscribe();
        let mut pipeline = CapturePipeline::new(16000, 1, &plain(), track);

        pipeline.push(&vec![0.1; 320]);
        let frame = rx.try_recv().unwrap();
        assert_eq!(frame.len(), SAMPLES_PER_FRAME);
    }

    #[test]
    fn test_pipeline_respects_constraints() {
        let track = MediaStreamTrack::new_audio("test");
        let all = CapturePipeline::new(48000, 1, &AudioConstraints::default(), track.clone());
        assert!(all.denoiser.is_some());
        assert!(all.agc.is_some());

        let none = CapturePipeline::new(48000, 1, &plain(), track);
        assert!(none.denoiser.is_none());
        assert!(none.agc.is_none());
    }
}
