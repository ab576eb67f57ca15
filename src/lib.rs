pub mod config;
pub mod error;
pub mod media;
pub mod room;
pub mod session;
pub mod webrtc;

use std::sync::Arc;

pub use config::{AudioConstraints, SessionConfig, SpeakingConfig};
pub use error::{DeviceAccessError, PeerError, SessionError, SessionResult, SignalingError};
pub use media::{CpalMediaDevices, MediaDevices, MediaStream, MediaStreamTrack, MemoryMediaDevices};
pub use room::{ParticipantProfile, ParticipantRecord, RoomError, RoomState, Roster, UserProfile};
pub use session::{AudioSession, Subscription, VoiceRoom};
pub use webrtc::{
    LocalSignalingHub, LoopbackPeerFactory, Membership, PeerConnection, PeerConnectionFactory,
    RemoteParticipant, Role, RtcPeerFactory, SignalingChannel,
};

/// Join a room from the command line: `voxroom [room-id] [user-id] [--listener]`.
/// Logs speaking changes until Ctrl+C.
pub async fn run() -> SessionResult<()> {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let is_speaker = !args.iter().any(|a| a == "--listener");
    let mut positional = args.iter().filter(|a| !a.starts_with("--"));
    let room_id = positional.next().cloned().unwrap_or_else(|| "lobby".to_string());
    let user_id = positional
        .next()
        .cloned()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let mut config = SessionConfig::load_or_default();
    if let Err(e) = config.validate() {
        tracing::warn!("Ignoring invalid config: {}", e);
        config = SessionConfig::default();
    }

    let devices = Arc::new(CpalMediaDevices::new(config.input_device.clone()));
    let factory = Arc::new(RtcPeerFactory::new()?);
    let hub = Arc::new(LocalSignalingHub::new());
    let session = Arc::new(AudioSession::with_signaling(config, devices, factory, hub));

    let room = VoiceRoom::new(session.clone(), room_id.clone(), user_id.clone());
    room.activate(is_speaker).await?;
    tracing::info!("{} is in room {} (Ctrl+C to leave)", user_id, room_id);

    if is_speaker {
        if let Some(muted) = room.toggle_mute() {
            tracing::info!("Microphone {}", if muted { "muted" } else { "live" });
        }
    }

    let mut speaking = room.speaking_updates();
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            changed = speaking.changed() => {
                if changed.is_err() {
                    break;
                }
                let now_speaking = *speaking.borrow();
                tracing::info!("{}", if now_speaking { "Speaking" } else { "Silent" });
            }
        }
    }

    room.deactivate().await;
    session.dispose().await;
    Ok(())
}
