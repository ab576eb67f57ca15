//! Room membership: joins, leaves and the offer/answer exchange.
//!
//! Setup and teardown are serialized behind one async lock. Microphone
//! acquisition happens before that lock is taken, so a `leave_room` issued
//! while the permission prompt is pending wins, and the stale join returns
//! [`SessionError::Superseded`].

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;

use super::registry::{CandidateRoute, PeerRegistry};
use super::signaling::{decode_description, encode_description, SignalMessage, SignalingChannel, SignalingMembership};
use crate::error::{SessionError, SessionResult};
use crate::media::CaptureManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Speaker,
    Listener,
}

impl Role {
    pub fn from_speaker(is_speaker: bool) -> Self {
        if is_speaker {
            Self::Speaker
        } else {
            Self::Listener
        }
    }

    pub fn is_speaker(self) -> bool {
        self == Self::Speaker
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Membership {
    NotJoined,
    Joining { role: Role },
    Joined { room_id: String, user_id: String, role: Role },
}

/// Identity of a joined signaling room, shared with the inbound pump
struct SignalContext {
    registry: Arc<PeerRegistry>,
    channel: Arc<dyn SignalingChannel>,
    room_id: String,
    local_id: String,
}

impl SignalContext {
    /// Create a connection to `peer` and send it an offer
    async fn offer_to(&self, peer: &str) -> SessionResult<()> {
        let participant = self.registry.add_participant(peer).await?;
        let offer = participant.connection.create_offer().await?;
        participant.connection.set_local_description(offer.clone()).await?;

        self.channel
            .send(SignalMessage::Offer {
                room_id: self.room_id.clone(),
                from: self.local_id.clone(),
                to: peer.to_string(),
                sdp_base64: encode_description(&offer)?,
            })
            .await?;
        tracing::debug!("Sent offer to {}", peer);
        Ok(())
    }

    async fn handle(&self, message: SignalMessage) -> SessionResult<()> {
        if message.room_id() != self.room_id || message.sender() == self.local_id {
            return Ok(());
        }
        if message.recipient().is_some_and(|to| to != self.local_id) {
            tracing::debug!("Ignoring signal addressed to {:?}", message.recipient());
            return Ok(());
        }

        match message {
            SignalMessage::Join { from, .. } => {
                // The newcomer sends the offer
                self.registry.add_participant(&from).await?;
            }
            SignalMessage::Leave { from, .. } => {
                self.registry.remove_participant(&from).await;
            }
            SignalMessage::Offer { from, sdp_base64, .. } => {
                let offer = decode_description(&sdp_base64)?;
                let participant = self.registry.add_participant(&from).await?;
                participant.connection.set_remote_description(offer).await?;
                let answer = participant.connection.create_answer().await?;
                participant.connection.set_local_description(answer.clone()).await?;

                self.channel
                    .send(SignalMessage::Answer {
                        room_id: self.room_id.clone(),
                        from: self.local_id.clone(),
                        to: from.clone(),
                        sdp_base64: encode_description(&answer)?,
                    })
                    .await?;
                tracing::debug!("Answered offer from {}", from);
            }
            SignalMessage::Answer { from, sdp_base64, .. } => {
                let answer = decode_description(&sdp_base64)?;
                match self.registry.get(&from) {
                    Some(participant) => participant.connection.set_remote_description(answer).await?,
                    None => tracing::warn!("Answer from unknown peer {}", from),
                }
            }
            SignalMessage::Candidate { from, candidate, .. } => match self.registry.get(&from) {
                Some(participant) => participant.connection.add_ice_candidate(candidate).await?,
                None => tracing::debug!("Candidate from unknown peer {}", from),
            },
        }
        Ok(())
    }

    /// Undo a half-finished join
    async fn abandon(&self) {
        self.registry.set_route(None);
        if let Err(e) = self.channel.leave(&self.room_id, &self.local_id).await {
            tracing::warn!("Failed to leave signaling room {}: {}", self.room_id, e);
        }
        self.registry.clear().await;
    }
}

struct ActiveSignaling {
    context: Arc<SignalContext>,
    pump: JoinHandle<()>,
}

pub struct SignalingCoordinator {
    capture: Arc<CaptureManager>,
    registry: Arc<PeerRegistry>,
    channel: Option<Arc<dyn SignalingChannel>>,
    membership: Mutex<Membership>,
    generation: AtomicU64,
    active: tokio::sync::Mutex<Option<ActiveSignaling>>,
}

impl SignalingCoordinator {
    /// Without a channel, speaker joins only reset the registry
    pub fn new(
        capture: Arc<CaptureManager>,
        registry: Arc<PeerRegistry>,
        channel: Option<Arc<dyn SignalingChannel>>,
    ) -> Self {
        Self {
            capture,
            registry,
            channel,
            membership: Mutex::new(Membership::NotJoined),
            generation: AtomicU64::new(0),
            active: tokio::sync::Mutex::new(None),
        }
    }

    pub fn membership(&self) -> Membership {
        self.membership.lock().clone()
    }

    pub fn is_connecting(&self) -> bool {
        matches!(*self.membership.lock(), Membership::Joining { .. })
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    pub async fn join_room(&self, room_id: &str, user_id: &str, role: Role) -> SessionResult<()> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::info!("Joining room {} as {:?}", room_id, role);

        if !role.is_speaker() {
            // Listeners neither capture nor touch peer connections
            *self.membership.lock() = Membership::Joined {
                room_id: room_id.to_string(),
                user_id: user_id.to_string(),
                role,
            };
            tracing::info!("Joined room {} as listener", room_id);
            return Ok(());
        }

        *self.membership.lock() = Membership::Joining { role };
        let acquired = self.capture.acquire().await;

        let mut active = self.active.lock().await;
        if !self.is_current(generation) {
            tracing::info!("Join of room {} superseded", room_id);
            return Err(SessionError::Superseded);
        }

        if let Err(e) = acquired {
            tracing::error!("Microphone unavailable for room {}: {}", room_id, e);
            *self.membership.lock() = Membership::NotJoined;
            return Err(e.into());
        }

        // Full reset on every speaker join
        self.teardown(&mut active).await;

        if let Some(channel) = self.channel.clone() {
            match self.connect(channel, room_id, user_id).await {
                Ok(signaling) => *active = Some(signaling),
                Err(e) => {
                    tracing::error!("Failed to set up peer connections for {}: {}", room_id, e);
                    *self.membership.lock() = Membership::NotJoined;
                    return Err(e);
                }
            }
        }

        if !self.is_current(generation) {
            return Err(SessionError::Superseded);
        }
        *self.membership.lock() = Membership::Joined {
            room_id: room_id.to_string(),
            user_id: user_id.to_string(),
            role,
        };
        tracing::info!("Joined room {} as {:?}", room_id, role);
        Ok(())
    }

    async fn connect(
        &self,
        channel: Arc<dyn SignalingChannel>,
        room_id: &str,
        user_id: &str,
    ) -> SessionResult<ActiveSignaling> {
        let SignalingMembership { peers, mut inbound } = channel.join(room_id, user_id).await?;

        let context = Arc::new(SignalContext {
            registry: self.registry.clone(),
            channel: channel.clone(),
            room_id: room_id.to_string(),
            local_id: user_id.to_string(),
        });
        self.registry.set_route(Some(CandidateRoute {
            channel,
            room_id: room_id.to_string(),
            local_id: user_id.to_string(),
        }));

        for peer in &peers {
            if let Err(e) = context.offer_to(peer).await {
                context.abandon().await;
                return Err(e);
            }
        }

        let pump_context = context.clone();
        let pump = tokio::spawn(async move {
            while let Some(message) = inbound.recv().await {
                if let Err(e) = pump_context.handle(message).await {
                    tracing::warn!("Failed to handle signaling message: {}", e);
                }
            }
            tracing::debug!("Signaling inbox for {} closed", pump_context.room_id);
        });

        tracing::info!("Connected to {} existing peers in {}", peers.len(), room_id);
        Ok(ActiveSignaling { context, pump })
    }

    async fn teardown(&self, active: &mut Option<ActiveSignaling>) {
        if let Some(signaling) = active.take() {
            signaling.pump.abort();
            let _ = signaling.pump.await;
            signaling.context.abandon().await;
        } else {
            self.registry.set_route(None);
            self.registry.clear().await;
        }
    }

    /// Tear down every peer and force mute. The local stream is kept.
    pub async fn leave_room(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        {
            let mut active = self.active.lock().await;
            self.teardown(&mut active).await;
        }
        self.capture.set_muted(true);
        *self.membership.lock() = Membership::NotJoined;
        tracing::info!("Left room");
    }
}
