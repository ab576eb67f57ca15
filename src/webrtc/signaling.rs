//! Room signaling: who is present, and relaying SDP and ICE between peers.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::mpsc;

use super::peer::{IceCandidate, SessionDescription};
use crate::error::SignalingError;

/// Messages exchanged between participants of a room
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SignalMessage {
    /// Participant entered the room
    #[serde(rename = "join")]
    Join { room_id: String, from: String },

    /// Participant left the room
    #[serde(rename = "leave")]
    Leave { room_id: String, from: String },

    #[serde(rename = "offer")]
    Offer {
        room_id: String,
        from: String,
        to: String,
        sdp_base64: String,
    },

    #[serde(rename = "answer")]
    Answer {
        room_id: String,
        from: String,
        to: String,
        sdp_base64: String,
    },

    #[serde(rename = "candidate")]
    Candidate {
        room_id: String,
        from: String,
        to: String,
        candidate: IceCandidate,
    },
}

impl SignalMessage {
    pub fn room_id(&self) -> &str {
        match self {
            Self::Join { room_id, .. }
            | Self::Leave { room_id, .. }
            | Self::Offer { room_id, .. }
            | Self::Answer { room_id, .. }
            | Self::Candidate { room_id, .. } => room_id,
        }
    }

    pub fn sender(&self) -> &str {
        match self {
            Self::Join { from, .. }
            | Self::Leave { from, .. }
            | Self::Offer { from, .. }
            | Self::Answer { from, .. }
            | Self::Candidate { from, .. } => from,
        }
    }

    /// Addressee, or `None` for room-wide announcements
    pub fn recipient(&self) -> Option<&str> {
        match self {
            Self::Join { .. } | Self::Leave { .. } => None,
            Self::Offer { to, .. } | Self::Answer { to, .. } | Self::Candidate { to, .. } => Some(to),
        }
    }

    pub fn to_json(&self) -> Result<String, SignalingError> {
        serde_json::to_string(self).map_err(|e| SignalingError::Encoding(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self, SignalingError> {
        serde_json::from_str(json).map_err(|e| SignalingError::Encoding(e.to_string()))
    }
}

/// Encode a session description as base64 JSON for the wire
pub fn encode_description(description: &SessionDescription) -> Result<String, SignalingError> {
    let json = serde_json::to_string(description).map_err(|e| SignalingError::Encoding(e.to_string()))?;
    Ok(BASE64.encode(json.as_bytes()))
}

pub fn decode_description(encoded: &str) -> Result<SessionDescription, SignalingError> {
    let json_bytes = BASE64
        .decode(encoded.trim())
        .map_err(|e| SignalingError::Encoding(format!("Invalid base64: {}", e)))?;
    let json = String::from_utf8(json_bytes)
        .map_err(|e| SignalingError::Encoding(format!("Invalid UTF-8: {}", e)))?;
    serde_json::from_str(&json).map_err(|e| SignalingError::Encoding(format!("Invalid description: {}", e)))
}

/// Result of joining a room
#[derive(Debug)]
pub struct SignalingMembership {
    /// Participants already present, excluding the joiner
    pub peers: Vec<String>,
    /// Messages addressed to the joiner or broadcast to the room
    pub inbound: mpsc::UnboundedReceiver<SignalMessage>,
}

#[async_trait]
pub trait SignalingChannel: Send + Sync {
    async fn join(&self, room_id: &str, participant_id: &str) -> Result<SignalingMembership, SignalingError>;

    async fn leave(&self, room_id: &str, participant_id: &str) -> Result<(), SignalingError>;

    /// Deliver to `message.recipient()`, or to every other member when it has no addressee
    async fn send(&self, message: SignalMessage) -> Result<(), SignalingError>;
}

type RoomMembers = HashMap<String, mpsc::UnboundedSender<SignalMessage>>;

/// In-process signaling router shared by sessions in the same process
#[derive(Default)]
pub struct LocalSignalingHub {
    rooms: Mutex<HashMap<String, RoomMembers>>,
}

impl LocalSignalingHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn members(&self, room_id: &str) -> Vec<String> {
        let mut members: Vec<String> = self
            .rooms
            .lock()
            .get(room_id)
            .map(|room| room.keys().cloned().collect())
            .unwrap_or_default();
        members.sort();
        members
    }

    fn broadcast(room: &RoomMembers, except: &str, message: &SignalMessage) {
        for (id, tx) in room.iter().filter(|(id, _)| id.as_str() != except) {
            if tx.send(message.clone()).is_err() {
                tracing::debug!("Member {} is no longer listening", id);
            }
        }
    }
}

#[async_trait]
impl SignalingChannel for LocalSignalingHub {
    async fn join(&self, room_id: &str, participant_id: &str) -> Result<SignalingMembership, SignalingError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut rooms = self.rooms.lock();
        let room = rooms.entry(room_id.to_string()).or_default();

        // Rejoining replaces the previous inbox
        room.insert(participant_id.to_string(), tx);

        let mut peers: Vec<String> = room.keys().filter(|id| id.as_str() != participant_id).cloned().collect();
        peers.sort();

        Self::broadcast(
            room,
            participant_id,
            &SignalMessage::Join {
                room_id: room_id.to_string(),
                from: participant_id.to_string(),
            },
        );

        tracing::info!("{} joined signaling room {} ({} peers)", participant_id, room_id, peers.len());
        Ok(SignalingMembership { peers, inbound: rx })
    }

    async fn leave(&self, room_id: &str, participant_id: &str) -> Result<(), SignalingError> {
        let mut rooms = self.rooms.lock();
        let room = rooms.get_mut(room_id).ok_or(SignalingError::NotJoined)?;
        if room.remove(participant_id).is_none() {
            return Err(SignalingError::NotJoined);
        }

        Self::broadcast(
            room,
            participant_id,
            &SignalMessage::Leave {
                room_id: room_id.to_string(),
                from: participant_id.to_string(),
            },
        );

        if room.is_empty() {
            rooms.remove(room_id);
        }
        tracing::info!("{} left signaling room {}", participant_id, room_id);
        Ok(())
    }

    async fn send(&self, message: SignalMessage) -> Result<(), SignalingError> {
        let rooms = self.rooms.lock();
        let room = rooms.get(message.room_id()).ok_or(SignalingError::NotJoined)?;
        if !room.contains_key(message.sender()) {
            return Err(SignalingError::NotJoined);
        }

        match message.recipient() {
            Some(to) => {
                let tx = room.get(to).ok_or_else(|| SignalingError::PeerUnreachable {
                    room_id: message.room_id().to_string(),
                    participant_id: to.to_string(),
                })?;
                tx.send(message.clone()).map_err(|_| SignalingError::Closed)
            }
            None => {
                Self::broadcast(room, message.sender(), &message);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offer(from: &str, to: &str) -> SignalMessage {
        SignalMessage::Offer {
            room_id: "room".into(),
            from: from.into(),
            to: to.into(),
            sdp_base64: encode_description(&SessionDescription::offer("v=0")).unwrap(),
        }
    }

    #[test]
    fn test_message_json_is_tagged() {
        let json = SignalMessage::Join {
            room_id: "room".into(),
            from: "alice".into(),
        }
        .to_json()
        .unwrap();
        assert!(json.contains(r#""type":"join""#));

        let parsed = SignalMessage::from_json(&offer("a", "b").to_json().unwrap()).unwrap();
        assert_eq!(parsed.recipient(), Some("b"));
        assert_eq!(parsed.sender(), "a");
    }

    #[test]
    fn test_description_encoding() {
        let description = SessionDescription::answer("v=0\r\no=- 1 1 IN IP4 0.0.0.0\r\n");
        let encoded = encode_description(&description).unwrap();
        assert!(!encoded.contains('\n'));
        assert_eq!(decode_description(&encoded).unwrap(), description);
        assert!(matches!(decode_description("@@@"), Err(SignalingError::Encoding(_))));
    }

    #[tokio::test]
    async fn test_join_reports_existing_peers_and_announces() {
        let hub = LocalSignalingHub::new();
        let mut alice = hub.join("room", "alice").await.unwrap();
        assert!(alice.peers.is_empty());

        let bob = hub.join("room", "bob").await.unwrap();
        assert_eq!(bob.peers, vec!["alice"]);

        let announced = alice.inbound.try_recv().unwrap();
        assert_eq!(
            announced,
            SignalMessage::Join {
                room_id: "room".into(),
                from: "bob".into()
            }
        );
    }

    #[tokio::test]
    async fn test_direct_send_routes_to_addressee_only() {
        let hub = LocalSignalingHub::new();
        let mut alice = hub.join("room", "alice").await.unwrap();
        let mut bob = hub.join("room", "bob").await.unwrap();
        let mut carol = hub.join("room", "carol").await.unwrap();
        while alice.inbound.try_recv().is_ok() {}
        while bob.inbound.try_recv().is_ok() {}

        hub.send(offer("alice", "bob")).await.unwrap();
        assert_eq!(bob.inbound.try_recv().unwrap().sender(), "alice");
        assert!(carol.inbound.try_recv().is_err());
        assert!(alice.inbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_send_errors() {
        let hub = LocalSignalingHub::new();
        assert!(matches!(hub.send(offer("alice", "bob")).await, Err(SignalingError::NotJoined)));

        let _alice = hub.join("room", "alice").await.unwrap();
        assert!(matches!(
            hub.send(offer("alice", "bob")).await,
            Err(SignalingError::PeerUnreachable { .. })
        ));
    }

    #[tokio::test]
    async fn test_leave_announces_and_cleans_up() {
        let hub = LocalSignalingHub::new();
        let mut alice = hub.join("room", "alice").await.unwrap();
        hub.join("room", "bob").await.unwrap();
        let _ = alice.inbound.try_recv();

        hub.leave("room", "bob").await.unwrap();
        assert_eq!(alice.inbound.try_recv().unwrap().sender(), "bob");
        assert_eq!(hub.members("room"), vec!["alice"]);

        assert!(matches!(hub.leave("room", "bob").await, Err(SignalingError::NotJoined)));
        hub.leave("room", "alice").await.unwrap();
        assert!(hub.members("room").is_empty());
    }
}
