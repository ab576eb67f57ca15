//! Loopback peer connections that record every call.
//!
//! Nothing leaves the process: inbound tracks and candidates are injected by
//! the caller with [`LoopbackPeer::deliver_track`] and
//! [`LoopbackPeer::emit_candidate`].

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use super::peer::{
    IceCandidate, IceCandidateHandler, PeerConnection, PeerConnectionFactory, RtcConfig,
    SessionDescription, TrackHandler,
};
use crate::error::PeerError;
use crate::media::{MediaStream, MediaStreamTrack};

type SharedCandidateHandler = Arc<dyn Fn(IceCandidate) + Send + Sync>;
type SharedTrackHandler = Arc<dyn Fn(MediaStreamTrack) + Send + Sync>;

pub struct LoopbackPeer {
    serial: usize,
    config: RtcConfig,
    closed: AtomicBool,
    close_calls: AtomicUsize,
    sent_tracks: Mutex<Vec<MediaStreamTrack>>,
    local_description: Mutex<Option<SessionDescription>>,
    remote_description: Mutex<Option<SessionDescription>>,
    remote_candidates: Mutex<Vec<IceCandidate>>,
    candidate_handler: Mutex<Option<SharedCandidateHandler>>,
    track_handler: Mutex<Option<SharedTrackHandler>>,
}

impl LoopbackPeer {
    fn new(serial: usize, config: RtcConfig) -> Self {
        Self {
            serial,
            config,
            closed: AtomicBool::new(false),
            close_calls: AtomicUsize::new(0),
            sent_tracks: Mutex::new(Vec::new()),
            local_description: Mutex::new(None),
            remote_description: Mutex::new(None),
            remote_candidates: Mutex::new(Vec::new()),
            candidate_handler: Mutex::new(None),
            track_handler: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &RtcConfig {
        &self.config
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    pub fn sent_tracks(&self) -> Vec<MediaStreamTrack> {
        self.sent_tracks.lock().clone()
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.local_description.lock().clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.remote_description.lock().clone()
    }

    pub fn remote_candidates(&self) -> Vec<IceCandidate> {
        self.remote_candidates.lock().clone()
    }

    /// Simulate a locally gathered candidate
    pub fn emit_candidate(&self, candidate: IceCandidate) {
        let handler = self.candidate_handler.lock().clone();
        if let Some(handler) = handler {
            handler(candidate);
        }
    }

    /// Simulate an inbound track arriving from the remote side
    pub fn deliver_track(&self, track: MediaStreamTrack) {
        let handler = self.track_handler.lock().clone();
        if let Some(handler) = handler {
            handler(track);
        }
    }

    fn ensure_open(&self) -> Result<(), PeerError> {
        if self.is_closed() {
            Err(PeerError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl PeerConnection for LoopbackPeer {
    async fn add_track(&self, track: &MediaStreamTrack, _stream: &MediaStream) -> Result<(), PeerError> {
        self.ensure_open()?;
        self.sent_tracks.lock().push(track.clone());
        Ok(())
    }

    fn on_ice_candidate(&self, handler: IceCandidateHandler) {
        *self.candidate_handler.lock() = Some(Arc::from(handler));
    }

    fn on_track(&self, handler: TrackHandler) {
        *self.track_handler.lock() = Some(Arc::from(handler));
    }

    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        self.ensure_open()?;
        Ok(SessionDescription::offer(format!("v=0 loopback-offer-{}", self.serial)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        self.ensure_open()?;
        if self.remote_description.lock().is_none() {
            return Err(PeerError::Negotiation("no remote offer to answer".into()));
        }
        Ok(SessionDescription::answer(format!("v=0 loopback-answer-{}", self.serial)))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), PeerError> {
        self.ensure_open()?;
        *self.local_description.lock() = Some(description);
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), PeerError> {
        self.ensure_open()?;
        *self.remote_description.lock() = Some(description);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        self.ensure_open()?;
        self.remote_candidates.lock().push(candidate);
        Ok(())
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Creates [`LoopbackPeer`]s and keeps a handle to each one
#[derive(Default)]
pub struct LoopbackPeerFactory {
    created: Mutex<Vec<Arc<LoopbackPeer>>>,
    fail_next: AtomicBool,
}

impl LoopbackPeerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `create` call fail
    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    pub fn created(&self) -> Vec<Arc<LoopbackPeer>> {
        self.created.lock().clone()
    }

    pub fn last(&self) -> Option<Arc<LoopbackPeer>> {
        self.created.lock().last().cloned()
    }
}

#[async_trait]
impl PeerConnectionFactory for LoopbackPeerFactory {
    async fn create(&self, config: &RtcConfig) -> Result<Arc<dyn PeerConnection>, PeerError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(PeerError::Create("loopback factory told to fail".into()));
        }
        let mut created = self.created.lock();
        let peer = Arc::new(LoopbackPeer::new(created.len(), config.clone()));
        created.push(peer.clone());
        Ok(peer)
    }
}
