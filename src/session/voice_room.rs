//! UI-facing view of one room: mute, participants and speaking state kept
//! in sync with an [`AudioSession`].

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

use super::{AudioSession, Subscription};
use crate::error::{SessionError, SessionResult};
use crate::media::SpeakingDetector;
use crate::webrtc::RemoteParticipant;

/// State written by session callbacks
struct RoomView {
    is_speaker: AtomicBool,
    is_muted: AtomicBool,
    connecting: AtomicBool,
    participants: Mutex<BTreeMap<String, RemoteParticipant>>,
    speaking: Arc<watch::Sender<bool>>,
}

impl RoomView {
    fn set_speaking(&self, speaking: bool) {
        self.speaking.send_if_modified(|current| {
            let changed = *current != speaking;
            *current = speaking;
            changed
        });
    }
}

pub struct VoiceRoom {
    session: Arc<AudioSession>,
    room_id: String,
    user_id: String,
    view: Arc<RoomView>,
    detector: Mutex<Option<SpeakingDetector>>,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl VoiceRoom {
    pub fn new(session: Arc<AudioSession>, room_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        let (speaking, _) = watch::channel(false);
        Self {
            session,
            room_id: room_id.into(),
            user_id: user_id.into(),
            view: Arc::new(RoomView {
                is_speaker: AtomicBool::new(false),
                is_muted: AtomicBool::new(true),
                connecting: AtomicBool::new(false),
                participants: Mutex::new(BTreeMap::new()),
                speaking: Arc::new(speaking),
            }),
            detector: Mutex::new(None),
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    fn subscribe(&self) {
        let mut subscriptions = self.subscriptions.lock();
        if !subscriptions.is_empty() {
            return;
        }

        let view = self.view.clone();
        subscriptions.push(self.session.on_participant_added(move |participant: &RemoteParticipant| {
            tracing::debug!("Participant {} added to voice room", participant.id);
            view.participants
                .lock()
                .insert(participant.id.clone(), participant.clone());
        }));

        let view = self.view.clone();
        subscriptions.push(self.session.on_participant_removed(move |participant_id: &str| {
            tracing::debug!("Participant {} removed from voice room", participant_id);
            view.participants.lock().remove(participant_id);
        }));

        let view = self.view.clone();
        subscriptions.push(self.session.on_mute_changed(move |muted: &bool| {
            view.is_muted.store(*muted, Ordering::SeqCst);
            if *muted {
                view.set_speaking(false);
            }
        }));
    }

    fn start_detector(&self) {
        let mut detector = self.detector.lock();
        if detector.as_ref().is_some_and(|d| d.is_running()) {
            return;
        }
        *detector = SpeakingDetector::start(
            self.session.capture(),
            &self.session.config().speaking,
            self.view.speaking.clone(),
        );
    }

    fn stop_detector(&self) {
        if let Some(mut detector) = self.detector.lock().take() {
            detector.stop();
        }
        self.view.set_speaking(false);
    }

    /// Join the room and start tracking it
    pub async fn activate(&self, is_speaker: bool) -> SessionResult<()> {
        self.subscribe();
        self.view.is_speaker.store(is_speaker, Ordering::SeqCst);
        self.view.connecting.store(true, Ordering::SeqCst);

        let joined = self.session.join_room(&self.room_id, &self.user_id, is_speaker).await;
        self.view.connecting.store(false, Ordering::SeqCst);

        if let Err(e) = joined {
            tracing::error!("Error connecting to room {}: {}", self.room_id, e);
            return Err(e);
        }

        self.view
            .is_muted
            .store(self.session.is_microphone_muted(), Ordering::SeqCst);
        tracing::info!(
            "Connected to room {} as {}",
            self.room_id,
            if is_speaker { "speaker" } else { "listener" }
        );

        if is_speaker {
            self.start_detector();
        }
        Ok(())
    }

    /// Rejoin with a new role. Every peer connection is rebuilt.
    pub async fn set_speaker(&self, is_speaker: bool) -> SessionResult<()> {
        tracing::info!("Speaker status changed, rejoining room {}", self.room_id);
        self.view.is_speaker.store(is_speaker, Ordering::SeqCst);
        if !is_speaker {
            self.stop_detector();
        }

        self.session.leave_room().await?;
        self.view.connecting.store(true, Ordering::SeqCst);
        let joined = self.session.join_room(&self.room_id, &self.user_id, is_speaker).await;
        self.view.connecting.store(false, Ordering::SeqCst);
        joined?;

        if is_speaker {
            self.session.set_muted(true)?;
            self.start_detector();
        }
        Ok(())
    }

    /// Speakers only; `None` for listeners
    pub fn toggle_mute(&self) -> Option<bool> {
        if !self.is_speaker() {
            return None;
        }
        match self.session.toggle_mute() {
            Ok(muted) => {
                self.view.is_muted.store(muted, Ordering::SeqCst);
                Some(muted)
            }
            Err(e) => {
                tracing::warn!("Cannot toggle mute: {}", e);
                None
            }
        }
    }

    /// Leave, stop analysis and detach from the session
    pub async fn deactivate(&self) {
        tracing::info!("Leaving room {}", self.room_id);
        match self.session.leave_room().await {
            Ok(()) | Err(SessionError::Disposed) => {}
            Err(e) => tracing::warn!("Error leaving room {}: {}", self.room_id, e),
        }
        self.stop_detector();
        for subscription in self.subscriptions.lock().drain(..) {
            subscription.unsubscribe();
        }
        self.view.participants.lock().clear();
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn is_speaker(&self) -> bool {
        self.view.is_speaker.load(Ordering::SeqCst)
    }

    pub fn is_muted(&self) -> bool {
        self.view.is_muted.load(Ordering::SeqCst)
    }

    pub fn is_speaking(&self) -> bool {
        *self.view.speaking.borrow()
    }

    pub fn speaking_updates(&self) -> watch::Receiver<bool> {
        self.view.speaking.subscribe()
    }

    pub fn is_connecting(&self) -> bool {
        self.view.connecting.load(Ordering::SeqCst)
    }

    /// Remote participants ordered by id
    pub fn participants(&self) -> Vec<RemoteParticipant> {
        self.view.participants.lock().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::media::{MediaStreamTrack, MemoryMediaDevices};
    use crate::webrtc::LoopbackPeerFactory;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::time::Duration;

    fn room() -> (VoiceRoom, Arc<AudioSession>, Arc<LoopbackPeerFactory>) {
        let mut config = SessionConfig::default();
        config.speaking.interval_ms = 20;
        let factory = Arc::new(LoopbackPeerFactory::new());
        let session = Arc::new(AudioSession::new(
            config,
            Arc::new(MemoryMediaDevices::new()),
            factory.clone(),
        ));
        (VoiceRoom::new(session.clone(), "room", "me"), session, factory)
    }

    fn spawn_voice(track: MediaStreamTrack) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut rng = StdRng::seed_from_u64(7);
            loop {
                let frame: Vec<f32> = (0..960).map(|_| rng.gen_range(-0.5..0.5)).collect();
                track.publish(&frame);
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
    }

    #[tokio::test]
    async fn test_listener_cannot_toggle_mute() {
        let (room, session, _) = room();
        room.activate(false).await.unwrap();
        assert_eq!(room.toggle_mute(), None);
        assert!(room.is_muted());
        assert!(session.get_local_stream().is_none());
        assert!(!room.is_speaking());
    }

    #[tokio::test]
    async fn test_participants_follow_session_events() {
        let (room, session, factory) = room();
        room.activate(true).await.unwrap();
        assert!(!room.is_connecting());

        session.add_participant("p1").await.unwrap();
        session.add_participant("p2").await.unwrap();
        factory.created()[0].deliver_track(MediaStreamTrack::new_audio("p1 mic"));

        let ids: Vec<String> = room.participants().into_iter().map(|p| p.id).collect();
        assert_eq!(ids, vec!["p1", "p2"]);
        assert!(room.participants()[0].stream.is_some());

        session.remove_participant("p1").await.unwrap();
        let ids: Vec<String> = room.participants().into_iter().map(|p| p.id).collect();
        assert_eq!(ids, vec!["p2"]);
    }

    #[tokio::test]
    async fn test_speaking_tracks_voice_and_mute() {
        let (room, session, _) = room();
        room.activate(true).await.unwrap();
        assert!(room.is_muted());

        let track = session.get_local_stream().unwrap().audio_tracks()[0].clone();
        let producer = spawn_voice(track);
        let mut updates = room.speaking_updates();

        assert_eq!(room.toggle_mute(), Some(false));
        tokio::time::timeout(Duration::from_secs(2), updates.wait_for(|s| *s))
            .await
            .expect("speaking detected")
            .unwrap();

        assert_eq!(room.toggle_mute(), Some(true));
        assert!(!room.is_speaking());

        producer.abort();
        room.deactivate().await;
    }

    #[tokio::test]
    async fn test_demotion_rejoins_as_listener() {
        let (room, session, _) = room();
        room.activate(true).await.unwrap();
        session.add_participant("p1").await.unwrap();

        let track = session.get_local_stream().unwrap().audio_tracks()[0].clone();
        let producer = spawn_voice(track);
        let mut updates = room.speaking_updates();
        assert_eq!(room.toggle_mute(), Some(false));
        tokio::time::timeout(Duration::from_secs(2), updates.wait_for(|s| *s))
            .await
            .expect("speaking detected")
            .unwrap();

        room.set_speaker(false).await.unwrap();
        assert!(!room.is_speaker());
        assert!(room.detector.lock().is_none());
        assert!(room.participants().is_empty());
        assert!(session.is_microphone_muted());
        assert!(!room.is_speaking());
        assert_eq!(room.toggle_mute(), None);
        assert!(!*updates.borrow_and_update());

        // Sampling is cancelled: an unmuted microphone no longer drives the state
        session.capture().set_muted(false);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!room.is_speaking());
        assert!(!updates.has_changed().unwrap());

        producer.abort();
        room.set_speaker(true).await.unwrap();
        assert!(room.is_muted());
        assert!(room.is_speaker());
        assert!(room.detector.lock().is_some());
    }

    #[tokio::test]
    async fn test_deactivate_detaches_from_session() {
        let (room, session, _) = room();
        room.activate(true).await.unwrap();
        room.deactivate().await;

        session.add_participant("late").await.unwrap();
        assert!(room.participants().is_empty());
        assert!(!room.is_speaking());
        assert!(session.is_microphone_muted());
    }

    #[tokio::test]
    async fn test_failed_join_clears_connecting() {
        let devices = Arc::new(MemoryMediaDevices::new());
        devices.deny(crate::error::DeviceAccessError::PermissionDenied("denied".into()));
        let session = Arc::new(AudioSession::new(
            SessionConfig::default(),
            devices,
            Arc::new(LoopbackPeerFactory::new()),
        ));
        let room = VoiceRoom::new(session, "room", "me");

        assert!(room.activate(true).await.is_err());
        assert!(!room.is_connecting());
        assert!(!room.is_speaking());
    }
}
