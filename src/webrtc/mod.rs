mod audio_track;
mod coordinator;
pub mod memory;
mod peer;
mod registry;
mod rtc;
mod signaling;

pub use audio_track::{register_audio_codec, OutboundAudioTrack, OPUS_PAYLOAD_TYPE};
pub use coordinator::{Membership, Role, SignalingCoordinator};
pub use memory::{LoopbackPeer, LoopbackPeerFactory};
pub use peer::{
    IceCandidate, IceCandidateHandler, PeerConnection, PeerConnectionFactory, RtcConfig, SdpKind,
    SessionDescription, TrackHandler,
};
pub use registry::{PeerRegistry, RemoteParticipant};
pub use rtc::{RtcPeer, RtcPeerFactory};
pub use signaling::{
    decode_description, encode_description, LocalSignalingHub, SignalMessage, SignalingChannel,
    SignalingMembership,
};
