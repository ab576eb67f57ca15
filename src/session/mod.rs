mod audio_session;
mod events;
mod voice_room;

pub use audio_session::AudioSession;
pub use events::{Observers, SessionEvents, Subscription};
pub use voice_room::VoiceRoom;
