//! Peer connections backed by webrtc-rs.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCRtpTransceiver, RTCRtpTransceiverInit};
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use super::audio_track::{register_audio_codec, spawn_inbound, OutboundAudioTrack};
use super::peer::{
    IceCandidate, IceCandidateHandler, PeerConnection, PeerConnectionFactory, RtcConfig, SdpKind,
    SessionDescription, TrackHandler,
};
use crate::error::PeerError;
use crate::media::{MediaStream, MediaStreamTrack};

/// Builds webrtc-rs peer connections with Opus registered
pub struct RtcPeerFactory {
    api: API,
}

impl RtcPeerFactory {
    pub fn new() -> Result<Self, PeerError> {
        let mut m = MediaEngine::default();
        register_audio_codec(&mut m).map_err(PeerError::Create)?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut m)
            .map_err(|e| PeerError::Create(format!("Failed to register interceptors: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(m)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self { api })
    }
}

#[async_trait]
impl PeerConnectionFactory for RtcPeerFactory {
    async fn create(&self, config: &RtcConfig) -> Result<Arc<dyn PeerConnection>, PeerError> {
        // One entry per URL, never a single entry listing all of them
        let ice_servers = config
            .ice_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .collect();

        let pc = self
            .api
            .new_peer_connection(RTCConfiguration {
                ice_servers,
                ..Default::default()
            })
            .await
            .map_err(|e| PeerError::Create(e.to_string()))?;

        Ok(Arc::new(RtcPeer::new(Arc::new(pc))))
    }
}

/// One webrtc-rs connection plus the tasks moving audio through it
pub struct RtcPeer {
    pc: Arc<RTCPeerConnection>,
    has_audio_section: AtomicBool,
    closed: AtomicBool,
    pumps: Mutex<Vec<JoinHandle<()>>>,
}

impl RtcPeer {
    fn new(pc: Arc<RTCPeerConnection>) -> Self {
        Self {
            pc,
            has_audio_section: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            pumps: Mutex::new(Vec::new()),
        }
    }

    fn ensure_open(&self) -> Result<(), PeerError> {
        if self.is_closed() {
            Err(PeerError::Closed)
        } else {
            Ok(())
        }
    }

    /// Receive-only audio, so a peer with no microphone still hears the room
    async fn ensure_audio_transceiver(&self) -> Result<(), PeerError> {
        if self.has_audio_section.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.pc
            .add_transceiver_from_kind(
                RTPCodecType::Audio,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Recvonly,
                    send_encodings: vec![],
                }),
            )
            .await
            .map_err(|e| PeerError::Track(format!("Failed to add audio transceiver: {}", e)))?;
        Ok(())
    }
}

fn to_rtc_description(description: SessionDescription) -> Result<RTCSessionDescription, PeerError> {
    let converted = match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(description.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(description.sdp),
    };
    converted.map_err(|e| PeerError::Negotiation(format!("Invalid SDP: {}", e)))
}

fn from_rtc_description(description: RTCSessionDescription) -> Result<SessionDescription, PeerError> {
    match description.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(description.sdp)),
        RTCSdpType::Answer => Ok(SessionDescription::answer(description.sdp)),
        other => Err(PeerError::Negotiation(format!("Unexpected SDP type: {}", other))),
    }
}

#[async_trait]
impl PeerConnection for RtcPeer {
    async fn add_track(&self, track: &MediaStreamTrack, stream: &MediaStream) -> Result<(), PeerError> {
        self.ensure_open()?;

        let outbound = Arc::new(OutboundAudioTrack::new(track.id(), stream.id()));
        let rtp_track: Arc<dyn TrackLocal + Send + Sync> = outbound.rtp_track();
        let sender = self
            .pc
            .add_track(rtp_track)
            .await
            .map_err(|e| PeerError::Track(format!("Failed to add audio track: {}", e)))?;
        self.has_audio_section.store(true, Ordering::SeqCst);

        let pump = outbound.spawn_pump(track).map_err(PeerError::Track)?;

        // Drain RTCP so interceptors keep running
        let rtcp = tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        });

        self.pumps.lock().extend([pump, rtcp]);
        tracing::info!("Local track {} attached", track.id());
        Ok(())
    }

    fn on_ice_candidate(&self, handler: IceCandidateHandler) {
        let handler: Arc<dyn Fn(IceCandidate) + Send + Sync> = Arc::from(handler);
        self.pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let handler = handler.clone();
            Box::pin(async move {
                // None marks the end of gathering
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(init) => handler(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                    }),
                    Err(e) => tracing::warn!("Failed to serialize ICE candidate: {}", e),
                }
            })
        }));
    }

    fn on_track(&self, handler: TrackHandler) {
        let handler: Arc<dyn Fn(MediaStreamTrack) + Send + Sync> = Arc::from(handler);
        self.pc.on_track(Box::new(
            move |remote: Arc<TrackRemote>, _receiver: Arc<RTCRtpReceiver>, _transceiver: Arc<RTCRtpTransceiver>| {
                let handler = handler.clone();
                Box::pin(async move {
                    if remote.kind() != RTPCodecType::Audio {
                        return;
                    }
                    match spawn_inbound(remote) {
                        Ok(track) => handler(track),
                        Err(e) => tracing::error!("Failed to start inbound audio: {}", e),
                    }
                })
            },
        ));
    }

    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        self.ensure_open()?;
        self.ensure_audio_transceiver().await?;
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| PeerError::Negotiation(format!("Failed to create offer: {}", e)))?;
        from_rtc_description(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        self.ensure_open()?;
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| PeerError::Negotiation(format!("Failed to create answer: {}", e)))?;
        from_rtc_description(answer)
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), PeerError> {
        self.ensure_open()?;
        self.pc
            .set_local_description(to_rtc_description(description)?)
            .await
            .map_err(|e| PeerError::Negotiation(format!("Failed to set local description: {}", e)))
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), PeerError> {
        self.ensure_open()?;
        self.pc
            .set_remote_description(to_rtc_description(description)?)
            .await
            .map_err(|e| PeerError::Negotiation(format!("Failed to set remote description: {}", e)))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        self.ensure_open()?;
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: None,
            })
            .await
            .map_err(|e| PeerError::Negotiation(format!("Failed to add ICE candidate: {}", e)))
    }

    async fn close(&self) -> Result<(), PeerError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        for task in self.pumps.lock().drain(..) {
            task.abort();
        }
        if let Err(e) = self.pc.close().await {
            tracing::warn!("Error closing peer connection: {}", e);
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
