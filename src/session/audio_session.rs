//! The per-room audio session handed to the UI layer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::events::{SessionEvents, Subscription};
use crate::config::SessionConfig;
use crate::error::{SessionError, SessionResult};
use crate::media::{CaptureManager, MediaDevices, MediaStream};
use crate::webrtc::{
    Membership, PeerConnectionFactory, PeerRegistry, RemoteParticipant, Role, RtcConfig,
    SignalingChannel, SignalingCoordinator,
};

/// Owns the microphone and every peer connection of one user.
///
/// Nothing outside the session closes a connection or stops a track; all
/// teardown goes through [`AudioSession::leave_room`],
/// [`AudioSession::remove_participant`] or [`AudioSession::dispose`].
pub struct AudioSession {
    config: SessionConfig,
    events: Arc<SessionEvents>,
    capture: Arc<CaptureManager>,
    registry: Arc<PeerRegistry>,
    coordinator: SignalingCoordinator,
    disposed: AtomicBool,
}

impl AudioSession {
    /// Session without a signaling channel: speaker joins reset the registry but
    /// never discover peers on their own.
    pub fn new(
        config: SessionConfig,
        devices: Arc<dyn MediaDevices>,
        factory: Arc<dyn PeerConnectionFactory>,
    ) -> Self {
        Self::build(config, devices, factory, None)
    }

    pub fn with_signaling(
        config: SessionConfig,
        devices: Arc<dyn MediaDevices>,
        factory: Arc<dyn PeerConnectionFactory>,
        channel: Arc<dyn SignalingChannel>,
    ) -> Self {
        Self::build(config, devices, factory, Some(channel))
    }

    fn build(
        config: SessionConfig,
        devices: Arc<dyn MediaDevices>,
        factory: Arc<dyn PeerConnectionFactory>,
        channel: Option<Arc<dyn SignalingChannel>>,
    ) -> Self {
        let events = Arc::new(SessionEvents::new());
        let capture = Arc::new(CaptureManager::new(devices, config.audio, events.clone()));
        let registry = Arc::new(PeerRegistry::new(
            factory,
            RtcConfig::new(config.ice_servers.clone()),
            capture.clone(),
            events.clone(),
        ));
        let coordinator = SignalingCoordinator::new(capture.clone(), registry.clone(), channel);

        Self {
            config,
            events,
            capture,
            registry,
            coordinator,
            disposed: AtomicBool::new(false),
        }
    }

    fn ensure_live(&self) -> SessionResult<()> {
        if self.disposed.load(Ordering::SeqCst) {
            Err(SessionError::Disposed)
        } else {
            Ok(())
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub(crate) fn capture(&self) -> Arc<CaptureManager> {
        self.capture.clone()
    }

    /// Speakers acquire the microphone (once per session) and connect to the
    /// room; listeners only record their membership.
    pub async fn join_room(&self, room_id: &str, user_id: &str, is_speaker: bool) -> SessionResult<()> {
        self.ensure_live()?;
        self.coordinator
            .join_room(room_id, user_id, Role::from_speaker(is_speaker))
            .await
    }

    /// Tear down every peer and force mute. The local stream stays allocated.
    pub async fn leave_room(&self) -> SessionResult<()> {
        self.ensure_live()?;
        self.coordinator.leave_room().await;
        Ok(())
    }

    pub fn set_muted(&self, muted: bool) -> SessionResult<()> {
        self.ensure_live()?;
        self.capture.set_muted(muted);
        Ok(())
    }

    /// Returns the new mute state
    pub fn toggle_mute(&self) -> SessionResult<bool> {
        self.ensure_live()?;
        Ok(self.capture.toggle_mute())
    }

    pub fn get_local_stream(&self) -> Option<MediaStream> {
        self.capture.stream()
    }

    pub fn is_microphone_muted(&self) -> bool {
        self.capture.is_muted()
    }

    pub fn on_participant_added<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&RemoteParticipant) + Send + Sync + 'static,
    {
        if self.is_disposed() {
            return Subscription::inert();
        }
        self.events.participant_added.subscribe(callback)
    }

    pub fn on_participant_removed<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        if self.is_disposed() {
            return Subscription::inert();
        }
        self.events.participant_removed.subscribe(callback)
    }

    pub fn on_mute_changed<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&bool) + Send + Sync + 'static,
    {
        if self.is_disposed() {
            return Subscription::inert();
        }
        self.events.mute_changed.subscribe(callback)
    }

    pub async fn add_participant(&self, participant_id: &str) -> SessionResult<RemoteParticipant> {
        self.ensure_live()?;
        Ok(self.registry.add_participant(participant_id).await?)
    }

    /// `Ok(false)` when the participant was not present
    pub async fn remove_participant(&self, participant_id: &str) -> SessionResult<bool> {
        self.ensure_live()?;
        Ok(self.registry.remove_participant(participant_id).await)
    }

    pub fn participant(&self, participant_id: &str) -> Option<RemoteParticipant> {
        self.registry.get(participant_id)
    }

    pub fn participants(&self) -> Vec<RemoteParticipant> {
        self.registry.snapshot()
    }

    pub fn membership(&self) -> Membership {
        self.coordinator.membership()
    }

    pub fn is_connecting(&self) -> bool {
        self.coordinator.is_connecting()
    }

    /// Close the microphone. Refused while any peer connection could still
    /// be sending its tracks.
    pub fn release_microphone(&self) -> SessionResult<()> {
        self.ensure_live()?;
        let connections = self.registry.len();
        if connections > 0 {
            return Err(SessionError::StreamInUse(connections));
        }
        self.capture.release();
        Ok(())
    }

    /// Leave, release the microphone and drop every subscriber.
    /// Every later fallible operation returns [`SessionError::Disposed`].
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.coordinator.leave_room().await;
        self.capture.release();
        self.events.clear();
        tracing::info!("Audio session disposed");
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DeviceAccessError;
    use crate::media::{MediaStreamTrack, MemoryMediaDevices};
    use crate::webrtc::{LoopbackPeerFactory, PeerConnection};
    use parking_lot::Mutex;

    struct Harness {
        session: AudioSession,
        devices: Arc<MemoryMediaDevices>,
        factory: Arc<LoopbackPeerFactory>,
        mutes: Arc<Mutex<Vec<bool>>>,
        added: Arc<Mutex<Vec<String>>>,
        removed: Arc<Mutex<Vec<String>>>,
    }

    fn harness() -> Harness {
        let devices = Arc::new(MemoryMediaDevices::new());
        let factory = Arc::new(LoopbackPeerFactory::new());
        let session = AudioSession::new(SessionConfig::default(), devices.clone(), factory.clone());

        let mutes = Arc::new(Mutex::new(Vec::new()));
        let added = Arc::new(Mutex::new(Vec::new()));
        let removed = Arc::new(Mutex::new(Vec::new()));
        let sink = mutes.clone();
        let _m = session.on_mute_changed(move |m: &bool| sink.lock().push(*m));
        let sink = added.clone();
        let _a = session.on_participant_added(move |p: &RemoteParticipant| sink.lock().push(p.id.clone()));
        let sink = removed.clone();
        let _r = session.on_participant_removed(move |id: &str| sink.lock().push(id.to_string()));

        Harness {
            session,
            devices,
            factory,
            mutes,
            added,
            removed,
        }
    }

    #[tokio::test]
    async fn test_set_muted_notifies_every_call() {
        let h = harness();
        h.session.join_room("room", "me", true).await.unwrap();
        h.mutes.lock().clear();

        h.session.set_muted(true).unwrap();
        h.session.set_muted(true).unwrap();

        assert_eq!(*h.mutes.lock(), vec![true, true]);
        let stream = h.session.get_local_stream().unwrap();
        assert!(stream.audio_tracks().iter().all(|t| !t.enabled()));
    }

    #[tokio::test]
    async fn test_speaker_starts_muted() {
        let h = harness();
        h.session.join_room("room", "me", true).await.unwrap();

        assert!(h.session.is_microphone_muted());
        let stream = h.session.get_local_stream().unwrap();
        assert!(!stream.audio_tracks().is_empty());
        assert!(stream.audio_tracks().iter().all(|t| !t.enabled()));
        assert_eq!(*h.mutes.lock(), vec![true]);
    }

    #[tokio::test]
    async fn test_microphone_acquired_once_per_session() {
        let h = harness();
        h.session.join_room("room", "me", true).await.unwrap();
        let first = h.session.get_local_stream().unwrap();
        h.session.leave_room().await.unwrap();
        h.session.join_room("room", "me", true).await.unwrap();

        assert_eq!(h.devices.requests(), 1);
        assert!(first.ptr_eq(&h.session.get_local_stream().unwrap()));
    }

    #[tokio::test]
    async fn test_listener_never_touches_microphone() {
        let h = harness();
        h.session.join_room("room", "me", false).await.unwrap();
        assert_eq!(h.devices.requests(), 0);
        assert!(h.session.get_local_stream().is_none());

        // A later listener join keeps whatever stream existed before
        h.session.join_room("room", "me", true).await.unwrap();
        let stream = h.session.get_local_stream().unwrap();
        h.session.join_room("room", "me", false).await.unwrap();
        assert_eq!(h.devices.requests(), 1);
        assert!(stream.ptr_eq(&h.session.get_local_stream().unwrap()));
    }

    #[tokio::test]
    async fn test_denied_microphone_surfaces_error() {
        let h = harness();
        h.devices.deny(DeviceAccessError::NoDevice);

        let err = h.session.join_room("room", "me", true).await.unwrap_err();
        assert!(matches!(err, SessionError::Device(DeviceAccessError::NoDevice)));
        assert_eq!(h.session.membership(), Membership::NotJoined);
        assert!(h.session.get_local_stream().is_none());
    }

    #[tokio::test]
    async fn test_speaker_session_lifecycle() {
        let h = harness();

        h.session.join_room("room-1", "me", true).await.unwrap();
        assert!(h.session.is_microphone_muted());

        assert!(!h.session.toggle_mute().unwrap());
        let local = h.session.get_local_stream().unwrap();
        assert!(local.audio_tracks()[0].enabled());

        h.session.add_participant("p1").await.unwrap();
        assert_eq!(*h.added.lock(), vec!["p1"]);
        let peer = h.factory.last().unwrap();
        assert_eq!(peer.sent_tracks().len(), 1);

        let remote = MediaStreamTrack::new_audio("p1 microphone");
        peer.deliver_track(remote.clone());
        let p1 = h.session.participant("p1").unwrap();
        assert_eq!(p1.stream.as_ref().unwrap().tracks().len(), 1);
        assert!(p1.current_audio_track().unwrap().ptr_eq(&remote));
        assert_eq!(*h.added.lock(), vec!["p1", "p1"]);

        h.session.leave_room().await.unwrap();
        assert!(h.session.participants().is_empty());
        assert!(peer.is_closed());
        assert!(remote.is_ended());
        assert_eq!(*h.removed.lock(), vec!["p1"]);
        assert!(h.session.is_microphone_muted());
        assert_eq!(h.mutes.lock().last(), Some(&true));

        // Stream retained for a fast rejoin
        let retained = h.session.get_local_stream().unwrap();
        assert!(retained.ptr_eq(&local));
        assert!(!retained.audio_tracks()[0].is_ended());
        assert!(!retained.audio_tracks()[0].enabled());
    }

    #[tokio::test]
    async fn test_remove_absent_participant_is_silent() {
        let h = harness();
        assert!(!h.session.remove_participant("ghost").await.unwrap());
        assert!(h.removed.lock().is_empty());
    }

    #[tokio::test]
    async fn test_release_refused_while_peers_exist() {
        let h = harness();
        h.session.join_room("room", "me", true).await.unwrap();
        h.session.add_participant("p1").await.unwrap();

        assert!(matches!(
            h.session.release_microphone(),
            Err(SessionError::StreamInUse(1))
        ));

        h.session.remove_participant("p1").await.unwrap();
        let stream = h.session.get_local_stream().unwrap();
        h.session.release_microphone().unwrap();
        assert!(h.session.get_local_stream().is_none());
        assert!(stream.audio_tracks()[0].is_ended());
    }

    #[tokio::test]
    async fn test_unsubscribed_callback_not_invoked() {
        let h = harness();
        let count = Arc::new(Mutex::new(0));
        let sink = count.clone();
        let sub = h.session.on_mute_changed(move |_| *sink.lock() += 1);

        h.session.set_muted(false).unwrap();
        sub.unsubscribe();
        h.session.set_muted(true).unwrap();
        assert_eq!(*count.lock(), 1);
    }

    #[tokio::test]
    async fn test_dispose_releases_everything() {
        let h = harness();
        h.session.join_room("room", "me", true).await.unwrap();
        h.session.add_participant("p1").await.unwrap();
        let stream = h.session.get_local_stream().unwrap();

        h.session.dispose().await;
        assert!(h.session.is_disposed());
        assert!(h.session.participants().is_empty());
        assert!(stream.audio_tracks()[0].is_ended());
        assert!(h.factory.last().unwrap().is_closed());

        assert!(matches!(
            h.session.join_room("room", "me", true).await,
            Err(SessionError::Disposed)
        ));
        assert!(matches!(h.session.set_muted(false), Err(SessionError::Disposed)));
        assert!(matches!(h.session.leave_room().await, Err(SessionError::Disposed)));

        let late = Arc::new(Mutex::new(0));
        let sink = late.clone();
        let sub = h.session.on_mute_changed(move |_| *sink.lock() += 1);
        assert!(h.session.events.mute_changed.is_empty());
        assert!(format!("{:?}", sub).contains("active: false"));
        sub.unsubscribe();
        assert_eq!(*late.lock(), 0);
    }

    #[tokio::test]
    async fn test_sessions_are_independent() {
        let a = harness();
        let b = harness();
        a.session.join_room("room", "a", true).await.unwrap();
        a.session.set_muted(false).unwrap();

        assert!(b.session.get_local_stream().is_none());
        assert!(b.session.is_microphone_muted());
        assert!(b.mutes.lock().is_empty());
    }
}
