//! Room roster: who is in a room, in which role, and the moderation rules
//! that move people between roles.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RoomError {
    #[error("Already in the room")]
    AlreadyInRoom,
    #[error("Not in the room")]
    NotInRoom,
    #[error("Participant {0} not found")]
    ParticipantNotFound(String),
    #[error("Only moderators can do that")]
    NotModerator,
    #[error("Participant is already a speaker")]
    AlreadySpeaker,
    #[error("Participant is not a speaker")]
    NotSpeaker,
    #[error("Moderators cannot target themselves")]
    SelfTarget,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: String,
    pub username: Option<String>,
    pub full_name: Option<String>,
    pub avatar_url: Option<String>,
}

/// Profile attached to a participant. A failed or missing profile lookup is
/// an explicit `Placeholder`, never a half-filled `UserProfile`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParticipantProfile {
    Known(UserProfile),
    Placeholder { user_id: String },
}

impl ParticipantProfile {
    pub fn user_id(&self) -> &str {
        match self {
            Self::Known(profile) => &profile.id,
            Self::Placeholder { user_id } => user_id,
        }
    }

    pub fn display_name(&self) -> &str {
        match self {
            Self::Known(profile) => profile
                .username
                .as_deref()
                .filter(|n| !n.is_empty())
                .or(profile.full_name.as_deref().filter(|n| !n.is_empty()))
                .unwrap_or("Unknown User"),
            Self::Placeholder { .. } => "Unknown User",
        }
    }

    /// Stored avatar, or a generated initials avatar
    pub fn avatar_url(&self) -> String {
        if let Self::Known(UserProfile {
            avatar_url: Some(url), ..
        }) = self
        {
            if !url.is_empty() {
                return url.clone();
            }
        }
        format!(
            "https://ui-avatars.com/api/?name={}&background=random",
            urlencoding::encode(self.display_name())
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantRecord {
    pub id: String,
    pub room_id: String,
    pub user_id: String,
    pub is_speaker: bool,
    pub is_moderator: bool,
    pub is_muted: bool,
    pub pending_speaker_request: bool,
    /// Unix seconds
    pub joined_at: u64,
}

impl ParticipantRecord {
    /// The room creator joins as speaker and moderator; everyone starts muted
    pub fn joining(room_id: &str, user_id: &str, is_creator: bool) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            room_id: room_id.to_string(),
            user_id: user_id.to_string(),
            is_speaker: is_creator,
            is_moderator: is_creator,
            is_muted: true,
            pending_speaker_request: false,
            joined_at: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RosterEntry {
    pub record: ParticipantRecord,
    pub profile: ParticipantProfile,
}

/// Participants split by role, with profiles merged in
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Roster {
    pub speakers: Vec<RosterEntry>,
    pub listeners: Vec<RosterEntry>,
}

impl Roster {
    pub fn build(records: &[ParticipantRecord], profiles: &HashMap<String, UserProfile>) -> Self {
        let mut roster = Self::default();
        for record in records {
            let profile = match profiles.get(&record.user_id) {
                Some(profile) => ParticipantProfile::Known(profile.clone()),
                None => {
                    tracing::debug!("No profile for {}, using placeholder", record.user_id);
                    ParticipantProfile::Placeholder {
                        user_id: record.user_id.clone(),
                    }
                }
            };
            let entry = RosterEntry {
                record: record.clone(),
                profile,
            };
            if record.is_speaker {
                roster.speakers.push(entry);
            } else {
                roster.listeners.push(entry);
            }
        }
        roster
    }

    /// Listeners waiting for a moderator's answer
    pub fn pending_requests(&self) -> impl Iterator<Item = &RosterEntry> {
        self.listeners.iter().filter(|e| e.record.pending_speaker_request)
    }

    pub fn moderators(&self) -> impl Iterator<Item = &RosterEntry> {
        self.speakers
            .iter()
            .chain(self.listeners.iter())
            .filter(|e| e.record.is_moderator)
    }
}

/// Participant records of one room, updated through the moderation rules
pub struct RoomState {
    room_id: String,
    creator_id: String,
    participants: RwLock<Vec<ParticipantRecord>>,
}

impl RoomState {
    pub fn new(room_id: impl Into<String>, creator_id: impl Into<String>) -> Self {
        Self {
            room_id: room_id.into(),
            creator_id: creator_id.into(),
            participants: RwLock::new(Vec::new()),
        }
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn records(&self) -> Vec<ParticipantRecord> {
        self.participants.read().clone()
    }

    pub fn record(&self, user_id: &str) -> Option<ParticipantRecord> {
        self.participants.read().iter().find(|p| p.user_id == user_id).cloned()
    }

    pub fn roster(&self, profiles: &HashMap<String, UserProfile>) -> Roster {
        Roster::build(&self.participants.read(), profiles)
    }

    pub fn join(&self, user_id: &str) -> Result<ParticipantRecord, RoomError> {
        let mut participants = self.participants.write();
        if participants.iter().any(|p| p.user_id == user_id) {
            return Err(RoomError::AlreadyInRoom);
        }
        let record = ParticipantRecord::joining(&self.room_id, user_id, user_id == self.creator_id);
        participants.push(record.clone());
        tracing::info!("{} joined room {}", user_id, self.room_id);
        Ok(record)
    }

    pub fn leave(&self, user_id: &str) -> Result<(), RoomError> {
        let mut participants = self.participants.write();
        let before = participants.len();
        participants.retain(|p| p.user_id != user_id);
        if participants.len() == before {
            return Err(RoomError::NotInRoom);
        }
        tracing::info!("{} left room {}", user_id, self.room_id);
        Ok(())
    }

    /// Mirror the local microphone state into the roster
    pub fn set_muted(&self, user_id: &str, muted: bool) -> Result<(), RoomError> {
        let mut participants = self.participants.write();
        let record = participants
            .iter_mut()
            .find(|p| p.user_id == user_id)
            .ok_or(RoomError::NotInRoom)?;
        record.is_muted = muted;
        Ok(())
    }

    pub fn request_to_speak(&self, user_id: &str) -> Result<(), RoomError> {
        let mut participants = self.participants.write();
        let record = participants
            .iter_mut()
            .find(|p| p.user_id == user_id)
            .ok_or(RoomError::NotInRoom)?;
        if record.is_speaker {
            return Err(RoomError::AlreadySpeaker);
        }
        record.is_muted = true;
        record.pending_speaker_request = true;
        Ok(())
    }

    /// Apply `change` to `target` on behalf of moderator `actor`
    fn moderate<T>(
        &self,
        actor: &str,
        target: &str,
        change: impl FnOnce(&mut ParticipantRecord) -> Result<T, RoomError>,
    ) -> Result<T, RoomError> {
        let mut participants = self.participants.write();
        let is_moderator = participants
            .iter()
            .find(|p| p.user_id == actor)
            .ok_or(RoomError::NotInRoom)?
            .is_moderator;
        if !is_moderator {
            return Err(RoomError::NotModerator);
        }
        if actor == target {
            return Err(RoomError::SelfTarget);
        }
        let record = participants
            .iter_mut()
            .find(|p| p.user_id == target)
            .ok_or_else(|| RoomError::ParticipantNotFound(target.to_string()))?;
        change(record)
    }

    pub fn promote(&self, actor: &str, target: &str) -> Result<(), RoomError> {
        self.moderate(actor, target, |record| {
            if record.is_speaker {
                return Err(RoomError::AlreadySpeaker);
            }
            record.is_speaker = true;
            record.is_muted = true;
            record.pending_speaker_request = false;
            Ok(())
        })?;
        tracing::info!("{} promoted {} to speaker", actor, target);
        Ok(())
    }

    pub fn demote(&self, actor: &str, target: &str) -> Result<(), RoomError> {
        self.moderate(actor, target, |record| {
            if !record.is_speaker {
                return Err(RoomError::NotSpeaker);
            }
            record.is_speaker = false;
            record.is_muted = true;
            record.pending_speaker_request = false;
            Ok(())
        })?;
        tracing::info!("{} demoted {} to listener", actor, target);
        Ok(())
    }

    pub fn deny_speaker_request(&self, actor: &str, target: &str) -> Result<(), RoomError> {
        self.moderate(actor, target, |record| {
            record.pending_speaker_request = false;
            Ok(())
        })
    }

    /// Flip the target's mute flag; returns the new value
    pub fn force_mute(&self, actor: &str, target: &str) -> Result<bool, RoomError> {
        self.moderate(actor, target, |record| {
            record.is_muted = !record.is_muted;
            Ok(record.is_muted)
        })
    }

    /// Flip moderator status; moderators are always speakers. Returns the new value.
    pub fn grant_moderator(&self, actor: &str, target: &str) -> Result<bool, RoomError> {
        self.moderate(actor, target, |record| {
            record.is_moderator = !record.is_moderator;
            record.is_speaker = true;
            Ok(record.is_moderator)
        })
    }

    pub fn remove(&self, actor: &str, target: &str) -> Result<ParticipantRecord, RoomError> {
        self.moderate(actor, target, |_| Ok(()))?;
        let mut participants = self.participants.write();
        let index = participants
            .iter()
            .position(|p| p.user_id == target)
            .ok_or_else(|| RoomError::ParticipantNotFound(target.to_string()))?;
        let removed = participants.remove(index);
        tracing::info!("{} removed {} from room {}", actor, target, self.room_id);
        Ok(removed)
    }
}
