//! Media tracks and streams.
//!
//! A [`MediaStreamTrack`] is a cheap, cloneable handle to one source of audio
//! frames. Producers (a capture thread, an RTP reader) call
//! [`MediaStreamTrack::publish`]; consumers (an RTP sender, the frequency
//! analyser) call [`MediaStreamTrack::subscribe`]. A disabled track keeps
//! producing frames, but they are silent. A stopped track produces nothing
//! and runs its stop hook exactly once.

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Mono 48kHz samples, shared between every subscriber
pub type AudioFrame = Arc<[f32]>;

/// Frames buffered per subscriber before it starts lagging
const FRAME_CHANNEL_CAPACITY: usize = 64;

type StopHook = Box<dyn FnOnce() + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
}

struct TrackInner {
    id: String,
    label: String,
    kind: TrackKind,
    enabled: AtomicBool,
    ended: AtomicBool,
    frames: broadcast::Sender<AudioFrame>,
    on_stop: Mutex<Option<StopHook>>,
}

#[derive(Clone)]
pub struct MediaStreamTrack {
    inner: Arc<TrackInner>,
}

impl MediaStreamTrack {
    pub fn new_audio(label: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), label)
    }

    pub fn with_id(id: impl Into<String>, label: impl Into<String>) -> Self {
        let (frames, _) = broadcast::channel(FRAME_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(TrackInner {
                id: id.into(),
                label: label.into(),
                kind: TrackKind::Audio,
                enabled: AtomicBool::new(true),
                ended: AtomicBool::new(false),
                frames,
                on_stop: Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn kind(&self) -> TrackKind {
        self.inner.kind
    }

    pub fn enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_ended(&self) -> bool {
        self.inner.ended.load(Ordering::SeqCst)
    }

    /// Install the hook that releases the underlying source.
    /// If the track is already stopped the hook runs immediately.
    pub fn set_stop_hook<F>(&self, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut slot = self.inner.on_stop.lock();
        if self.is_ended() {
            drop(slot);
            hook();
            return;
        }
        *slot = Some(Box::new(hook));
    }

    /// Stop the track for good. Idempotent.
    pub fn stop(&self) {
        // `ended` flips under the hook lock so a concurrent set_stop_hook
        // either sees it or leaves its hook for us to take
        let hook = {
            let mut slot = self.inner.on_stop.lock();
            if self.inner.ended.swap(true, Ordering::SeqCst) {
                return;
            }
            slot.take()
        };
        if let Some(hook) = hook {
            hook();
        }
        tracing::debug!("Track {} ({}) stopped", self.inner.id, self.inner.label);
    }

    /// Push a frame to every subscriber. Silent while disabled, dropped once ended.
    pub fn publish(&self, samples: &[f32]) {
        if self.is_ended() || self.inner.frames.receiver_count() == 0 {
            return;
        }
        let frame: AudioFrame = if self.enabled() {
            Arc::from(samples)
        } else {
            Arc::from(vec![0.0f32; samples.len()])
        };
        let _ = self.inner.frames.send(frame);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AudioFrame> {
        self.inner.frames.subscribe()
    }

    pub fn downgrade(&self) -> WeakMediaStreamTrack {
        WeakMediaStreamTrack {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn ptr_eq(&self, other: &MediaStreamTrack) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for MediaStreamTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaStreamTrack")
            .field("id", &self.inner.id)
            .field("label", &self.inner.label)
            .field("kind", &self.inner.kind)
            .field("enabled", &self.enabled())
            .field("ended", &self.is_ended())
            .finish()
    }
}

/// Non-owning track reference; the owning [`MediaStream`] keeps it alive.
#[derive(Clone, Default)]
pub struct WeakMediaStreamTrack {
    inner: Weak<TrackInner>,
}

impl WeakMediaStreamTrack {
    pub fn upgrade(&self) -> Option<MediaStreamTrack> {
        self.inner.upgrade().map(|inner| MediaStreamTrack { inner })
    }
}

impl fmt::Debug for WeakMediaStreamTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.upgrade() {
            Some(track) => write!(f, "WeakMediaStreamTrack({})", track.id()),
            None => write!(f, "WeakMediaStreamTrack(<dropped>)"),
        }
    }
}

struct StreamInner {
    id: String,
    tracks: Mutex<Vec<MediaStreamTrack>>,
}

/// Shared container of tracks
#[derive(Clone)]
pub struct MediaStream {
    inner: Arc<StreamInner>,
}

impl Default for MediaStream {
    fn default() -> Self {
        Self::new()
    }
}

impl MediaStream {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(StreamInner {
                id: Uuid::new_v4().to_string(),
                tracks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn with_tracks(tracks: Vec<MediaStreamTrack>) -> Self {
        let stream = Self::new();
        for track in tracks {
            stream.add_track(track);
        }
        stream
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Append a track; a track already present is ignored
    pub fn add_track(&self, track: MediaStreamTrack) {
        let mut tracks = self.inner.tracks.lock();
        if !tracks.iter().any(|t| t.ptr_eq(&track)) {
            tracks.push(track);
        }
    }

    pub fn tracks(&self) -> Vec<MediaStreamTrack> {
        self.inner.tracks.lock().clone()
    }

    pub fn audio_tracks(&self) -> Vec<MediaStreamTrack> {
        self.inner
            .tracks
            .lock()
            .iter()
            .filter(|t| t.kind() == TrackKind::Audio)
            .cloned()
            .collect()
    }

    pub fn stop_all(&self) {
        for track in self.tracks() {
            track.stop();
        }
    }

    pub fn ptr_eq(&self, other: &MediaStream) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for MediaStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaStream")
            .field("id", &self.inner.id)
            .field("tracks", &*self.inner.tracks.lock())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_disabled_track_publishes_silence() {
        let track = MediaStreamTrack::new_audio("mic");
        let mut rx = track.subscribe();

        track.set_enabled(false);
        track.publish(&[0.5, -0.5]);
        let frame = rx.try_recv().unwrap();
        assert!(frame.iter().all(|s| *s == 0.0));

        track.set_enabled(true);
        track.publish(&[0.5, -0.5]);
        let frame = rx.try_recv().unwrap();
        assert_eq!(&*frame, &[0.5, -0.5]);
    }

    #[test]
    fn test_stop_runs_hook_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let track = MediaStreamTrack::new_audio("mic");
        let counter = calls.clone();
        track.set_stop_hook(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        track.stop();
        track.stop();
        assert!(track.is_ended());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_hook_on_stopped_track_runs_immediately() {
        let track = MediaStreamTrack::new_audio("mic");
        track.stop();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        track.set_stop_hook(move || flag.store(true, Ordering::SeqCst));
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_hook_installed_during_stop_runs_once() {
        for _ in 0..200 {
            let track = MediaStreamTrack::new_audio("mic");
            let calls = Arc::new(AtomicUsize::new(0));

            let stopper = {
                let track = track.clone();
                std::thread::spawn(move || track.stop())
            };
            let counter = calls.clone();
            track.set_stop_hook(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
            stopper.join().unwrap();

            assert!(track.is_ended());
            assert_eq!(calls.load(Ordering::SeqCst), 1);
        }
    }

    #[test]
    fn test_ended_track_publishes_nothing() {
        let track = MediaStreamTrack::new_audio("mic");
        let mut rx = track.subscribe();
        track.stop();
        track.publish(&[1.0]);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_stream_ignores_duplicate_tracks() {
        let track = MediaStreamTrack::new_audio("mic");
        let stream = MediaStream::new();
        stream.add_track(track.clone());
        stream.add_track(track.clone());
        assert_eq!(stream.tracks().len(), 1);

        stream.stop_all();
        assert!(track.is_ended());
    }

    #[test]
    fn test_weak_track_does_not_keep_track_alive() {
        let weak = {
            let track = MediaStreamTrack::new_audio("remote");
            let weak = track.downgrade();
            assert!(weak.upgrade().is_some());
            weak
        };
        assert!(weak.upgrade().is_none());
    }
}
