use thiserror::Error;

/// Microphone could not be opened.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceAccessError {
    #[error("Microphone permission denied: {0}")]
    PermissionDenied(String),
    #[error("No capturable audio input device")]
    NoDevice,
    #[error("Audio input device unavailable: {0}")]
    Unavailable(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalingError {
    #[error("Not joined to a signaling room")]
    NotJoined,
    #[error("Peer {participant_id} is not reachable in room {room_id}")]
    PeerUnreachable {
        room_id: String,
        participant_id: String,
    },
    #[error("Failed to encode signaling payload: {0}")]
    Encoding(String),
    #[error("Signaling channel closed")]
    Closed,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PeerError {
    #[error("Failed to create peer connection: {0}")]
    Create(String),
    #[error("Negotiation failed: {0}")]
    Negotiation(String),
    #[error("Track error: {0}")]
    Track(String),
    #[error("Peer connection closed")]
    Closed,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Config parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Device(#[from] DeviceAccessError),
    #[error(transparent)]
    Signaling(#[from] SignalingError),
    #[error(transparent)]
    Peer(#[from] PeerError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("Join was superseded by a later leave or join")]
    Superseded,
    #[error("Session has been disposed")]
    Disposed,
    #[error("Local stream still attached to {0} peer connection(s)")]
    StreamInUse(usize),
}

pub type SessionResult<T> = Result<T, SessionError>;
