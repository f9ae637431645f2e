//! Tabu Common Library
//!
//! Wire types shared by every participant of a Tabu room: audio frames,
//! the channel message vocabulary and the turn/roster model.

pub mod protocol;
pub mod turn;
pub mod voice;

pub use protocol::{ChannelMessage, IceCandidate, SdpType, SessionDescription};
pub use turn::{ListenerScope, Phase, Roster, SpeakerRule, TeamId, TurnContext, TurnPolicy};
pub use voice::{AudioFormat, AudioFrame, CodecKind, FramePacket, VoiceQuality};

/// Application name, used for config directories and logging
pub const APP_NAME: &str = "tabu-voice";

/// Default game server URL for the WebSocket channel
pub const DEFAULT_SERVER_URL: &str = "ws://localhost:3001/ws";
