//! Registry of remote participants and their peer connections.
//!
//! An entry exists exactly while its connection is open. The only teardown
//! path is [`PeerRegistry::remove_participant`], which closes the connection
//! and stops every inbound track before notifying observers.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::peer::{PeerConnection, PeerConnectionFactory, RtcConfig};
use super::signaling::{SignalMessage, SignalingChannel};
use crate::error::PeerError;
use crate::media::{CaptureManager, MediaStream, MediaStreamTrack, WeakMediaStreamTrack};
use crate::session::SessionEvents;

/// One other user in the audio session
#[derive(Clone)]
pub struct RemoteParticipant {
    pub id: String,
    pub connection: Arc<dyn PeerConnection>,
    /// Inbound tracks, created when the first one arrives
    pub stream: Option<MediaStream>,
    /// Last inbound audio track; owned by `stream`
    pub audio_track: Option<WeakMediaStreamTrack>,
    serial: u64,
}

impl RemoteParticipant {
    pub fn current_audio_track(&self) -> Option<MediaStreamTrack> {
        self.audio_track.as_ref().and_then(|t| t.upgrade())
    }
}

impl fmt::Debug for RemoteParticipant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteParticipant")
            .field("id", &self.id)
            .field("connection_closed", &self.connection.is_closed())
            .field("stream", &self.stream)
            .field("audio_track", &self.audio_track)
            .finish()
    }
}

/// Where locally gathered ICE candidates are forwarded
#[derive(Clone)]
pub(crate) struct CandidateRoute {
    pub channel: Arc<dyn SignalingChannel>,
    pub room_id: String,
    pub local_id: String,
}

pub struct PeerRegistry {
    factory: Arc<dyn PeerConnectionFactory>,
    rtc_config: RtcConfig,
    capture: Arc<CaptureManager>,
    events: Arc<SessionEvents>,
    participants: Arc<Mutex<HashMap<String, RemoteParticipant>>>,
    route: Arc<RwLock<Option<CandidateRoute>>>,
    next_serial: AtomicU64,
}

impl PeerRegistry {
    pub fn new(
        factory: Arc<dyn PeerConnectionFactory>,
        rtc_config: RtcConfig,
        capture: Arc<CaptureManager>,
        events: Arc<SessionEvents>,
    ) -> Self {
        Self {
            factory,
            rtc_config,
            capture,
            events,
            participants: Arc::new(Mutex::new(HashMap::new())),
            route: Arc::new(RwLock::new(None)),
            next_serial: AtomicU64::new(0),
        }
    }

    pub(crate) fn set_route(&self, route: Option<CandidateRoute>) {
        *self.route.write() = route;
    }

    pub fn get(&self, participant_id: &str) -> Option<RemoteParticipant> {
        self.participants.lock().get(participant_id).cloned()
    }

    pub fn contains(&self, participant_id: &str) -> bool {
        self.participants.lock().contains_key(participant_id)
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.participants.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn snapshot(&self) -> Vec<RemoteParticipant> {
        self.participants.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.participants.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Build a connection for `participant_id`, attach local audio and wire its handlers
    async fn create_connection(
        &self,
        participant_id: &str,
        serial: u64,
    ) -> Result<Arc<dyn PeerConnection>, PeerError> {
        let connection = self.factory.create(&self.rtc_config).await?;

        if let Some(stream) = self.capture.stream() {
            for track in stream.audio_tracks().into_iter().filter(|t| !t.is_ended()) {
                if let Err(e) = connection.add_track(&track, &stream).await {
                    let _ = connection.close().await;
                    return Err(e);
                }
            }
        }

        let route = self.route.clone();
        let peer_id = participant_id.to_string();
        connection.on_ice_candidate(Box::new(move |candidate| {
            let route = route.read().clone();
            let Some(route) = route else {
                tracing::debug!("ICE candidate generated for {}: {}", peer_id, candidate.candidate);
                return;
            };
            let message = SignalMessage::Candidate {
                room_id: route.room_id,
                from: route.local_id,
                to: peer_id.clone(),
                candidate,
            };
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    let channel = route.channel;
                    let peer_id = peer_id.clone();
                    handle.spawn(async move {
                        if let Err(e) = channel.send(message).await {
                            tracing::warn!("Failed to forward ICE candidate to {}: {}", peer_id, e);
                        }
                    });
                }
                Err(_) => tracing::warn!("No runtime to forward ICE candidate to {}", peer_id),
            }
        }));

        let participants = self.participants.clone();
        let events = self.events.clone();
        let peer_id = participant_id.to_string();
        connection.on_track(Box::new(move |track: MediaStreamTrack| {
            tracing::info!("Track {} received from peer {}", track.id(), peer_id);
            let updated = {
                let mut map = participants.lock();
                match map.get_mut(&peer_id).filter(|p| p.serial == serial) {
                    Some(entry) => {
                        let stream = entry.stream.get_or_insert_with(MediaStream::new);
                        stream.add_track(track.clone());
                        entry.audio_track = Some(track.downgrade());
                        Some(entry.clone())
                    }
                    None => None,
                }
            };
            match updated {
                Some(participant) => events.participant_added.emit(&participant),
                None => {
                    tracing::debug!("Dropping track for departed peer {}", peer_id);
                    track.stop();
                }
            }
        }));

        Ok(connection)
    }

    /// Return the existing entry or create one with a fresh connection
    pub async fn add_participant(&self, participant_id: &str) -> Result<RemoteParticipant, PeerError> {
        let existing = self.get(participant_id);
        if let Some(existing) = existing {
            return Ok(existing);
        }

        let serial = self.next_serial.fetch_add(1, Ordering::SeqCst);
        let connection = self.create_connection(participant_id, serial).await?;

        let inserted = {
            let mut map = self.participants.lock();
            match map.get(participant_id) {
                Some(existing) => Err(existing.clone()),
                None => {
                    let participant = RemoteParticipant {
                        id: participant_id.to_string(),
                        connection: connection.clone(),
                        stream: None,
                        audio_track: None,
                        serial,
                    };
                    map.insert(participant_id.to_string(), participant.clone());
                    Ok(participant)
                }
            }
        };

        match inserted {
            Ok(participant) => {
                tracing::info!("Participant {} added", participant_id);
                self.events.participant_added.emit(&participant);
                Ok(participant)
            }
            Err(existing) => {
                // Lost a race with a concurrent add for the same id
                let _ = connection.close().await;
                Ok(existing)
            }
        }
    }

    /// Close the connection, stop inbound tracks, forget the entry, notify.
    /// Returns `false` (and notifies nobody) when the id is unknown.
    pub async fn remove_participant(&self, participant_id: &str) -> bool {
        let removed = self.participants.lock().remove(participant_id);
        let Some(participant) = removed else {
            return false;
        };

        if let Err(e) = participant.connection.close().await {
            tracing::warn!("Error closing connection to {}: {}", participant_id, e);
        }
        if let Some(stream) = &participant.stream {
            stream.stop_all();
        }

        tracing::info!("Participant {} removed", participant_id);
        self.events.participant_removed.emit(participant_id);
        true
    }

    /// Remove every entry; returns how many were torn down
    pub async fn clear(&self) -> usize {
        let ids = self.ids();
        let mut removed = 0;
        for id in ids {
            if self.remove_participant(&id).await {
                removed += 1;
            }
        }
        removed
    }
}
