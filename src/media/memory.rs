//! In-memory microphone for tests and headless runs.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::{MediaDevices, MediaStream, MediaStreamTrack};
use crate::config::AudioConstraints;
use crate::error::DeviceAccessError;

/// Hands out a stream with one silent audio track per request.
/// Frames are pushed by the caller through [`MediaStreamTrack::publish`].
#[derive(Default)]
pub struct MemoryMediaDevices {
    requests: AtomicUsize,
    denial: Mutex<Option<DeviceAccessError>>,
    last_constraints: Mutex<Option<AudioConstraints>>,
    issued: Mutex<Vec<MediaStream>>,
}

impl MemoryMediaDevices {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every following request with `error`
    pub fn deny(&self, error: DeviceAccessError) {
        *self.denial.lock() = Some(error);
    }

    pub fn allow(&self) {
        *self.denial.lock() = None;
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn last_constraints(&self) -> Option<AudioConstraints> {
        *self.last_constraints.lock()
    }

    /// Streams handed out so far, oldest first
    pub fn issued(&self) -> Vec<MediaStream> {
        self.issued.lock().clone()
    }
}

#[async_trait]
impl MediaDevices for MemoryMediaDevices {
    async fn get_user_media(
        &self,
        constraints: &AudioConstraints,
    ) -> Result<MediaStream, DeviceAccessError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        *self.last_constraints.lock() = Some(*constraints);

        if let Some(error) = self.denial.lock().clone() {
            return Err(error);
        }

        let stream = MediaStream::with_tracks(vec![MediaStreamTrack::new_audio("Memory microphone")]);
        self.issued.lock().push(stream.clone());
        Ok(stream)
    }
}
