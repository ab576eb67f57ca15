//! Local microphone ownership and mute state.

use parking_lot::Mutex;
use std::sync::Arc;

use super::{MediaDevices, MediaStream};
use crate::config::AudioConstraints;
use crate::error::DeviceAccessError;
use crate::session::SessionEvents;

#[derive(Debug)]
struct LocalCaptureState {
    stream: Option<MediaStream>,
    muted: bool,
    initialized: bool,
}

/// Acquires, mutes and releases the local microphone.
///
/// The only component allowed to flip the enabled flag of local tracks.
/// `muted == true` always implies every local audio track is disabled.
pub struct CaptureManager {
    devices: Arc<dyn MediaDevices>,
    constraints: AudioConstraints,
    events: Arc<SessionEvents>,
    state: Mutex<LocalCaptureState>,
    // Serializes acquisitions so the device is opened at most once
    acquiring: tokio::sync::Mutex<()>,
}

impl CaptureManager {
    pub fn new(
        devices: Arc<dyn MediaDevices>,
        constraints: AudioConstraints,
        events: Arc<SessionEvents>,
    ) -> Self {
        Self {
            devices,
            constraints,
            events,
            state: Mutex::new(LocalCaptureState {
                stream: None,
                muted: true,
                initialized: false,
            }),
            acquiring: tokio::sync::Mutex::new(()),
        }
    }

    /// Open the microphone unless a stream is already held.
    ///
    /// A fresh stream starts muted; the mute-changed notification fires.
    pub async fn acquire(&self) -> Result<MediaStream, DeviceAccessError> {
        let _guard = self.acquiring.lock().await;

        if let Some(stream) = self.state.lock().stream.clone() {
            return Ok(stream);
        }

        tracing::info!(
            "Opening microphone (echo_cancellation={}, noise_suppression={}, auto_gain_control={})",
            self.constraints.echo_cancellation,
            self.constraints.noise_suppression,
            self.constraints.auto_gain_control
        );

        let stream = match self.devices.get_user_media(&self.constraints).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!("Error accessing microphone: {}", e);
                return Err(e);
            }
        };

        for track in stream.audio_tracks() {
            track.set_enabled(false);
        }

        {
            let mut state = self.state.lock();
            state.stream = Some(stream.clone());
            state.initialized = true;
        }
        self.set_muted(true);

        tracing::info!("Local stream {} initialized", stream.id());
        Ok(stream)
    }

    /// Enable or disable every local audio track. Always notifies.
    pub fn set_muted(&self, muted: bool) {
        {
            let mut state = self.state.lock();
            state.muted = muted;
            if let Some(stream) = &state.stream {
                for track in stream.audio_tracks() {
                    track.set_enabled(!muted);
                }
            }
        }
        tracing::debug!("Local audio {}", if muted { "muted" } else { "unmuted" });
        self.events.mute_changed.emit(&muted);
    }

    pub fn toggle_mute(&self) -> bool {
        let muted = !self.is_muted();
        self.set_muted(muted);
        muted
    }

    pub fn is_muted(&self) -> bool {
        self.state.lock().muted
    }

    pub fn stream(&self) -> Option<MediaStream> {
        self.state.lock().stream.clone()
    }

    /// Whether the device has been opened at least once
    pub fn is_initialized(&self) -> bool {
        self.state.lock().initialized
    }

    /// Stop every local track and forget the stream. The next `acquire` reopens the device.
    pub fn release(&self) {
        let stream = {
            let mut state = self.state.lock();
            state.muted = true;
            state.stream.take()
        };
        if let Some(stream) = stream {
            stream.stop_all();
            tracing::info!("Local stream {} released", stream.id());
        }
    }
}
