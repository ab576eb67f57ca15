//! Peer-connection capability consumed by the registry.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::PeerError;
use crate::media::{MediaStream, MediaStreamTrack};

/// ICE configuration handed to every new connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtcConfig {
    /// One independent ICE server entry per URL
    pub ice_servers: Vec<String>,
}

impl RtcConfig {
    pub fn new(ice_servers: Vec<String>) -> Self {
        Self { ice_servers }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_mline_index: Option<u16>,
}

pub type IceCandidateHandler = Box<dyn Fn(IceCandidate) + Send + Sync>;
pub type TrackHandler = Box<dyn Fn(MediaStreamTrack) + Send + Sync>;

/// One transport session with a remote participant.
///
/// Handlers may be invoked from any task; they must not block.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Send `track` (belonging to `stream`) to the remote side
    async fn add_track(&self, track: &MediaStreamTrack, stream: &MediaStream) -> Result<(), PeerError>;

    /// Called for every locally gathered candidate
    fn on_ice_candidate(&self, handler: IceCandidateHandler);

    /// Called for every inbound track
    fn on_track(&self, handler: TrackHandler);

    async fn create_offer(&self) -> Result<SessionDescription, PeerError>;

    async fn create_answer(&self) -> Result<SessionDescription, PeerError>;

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), PeerError>;

    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), PeerError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError>;

    /// Tear the connection down; calling it twice is harmless
    async fn close(&self) -> Result<(), PeerError>;

    fn is_closed(&self) -> bool;
}

#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create(&self, config: &RtcConfig) -> Result<Arc<dyn PeerConnection>, PeerError>;
}
