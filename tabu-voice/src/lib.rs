//! Tabu Voice
//!
//! Turn-gated voice relay for the Tabu word-guessing game. Only the current
//! speaker transmits; only the speaker's eligible listeners hear. Frames
//! travel either through the room server (relay) or over per-remote direct
//! links negotiated through it.

pub mod channel;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod session;
pub mod signaling;
pub mod transport;
pub mod voice;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{Result, VoiceError};
pub use lifecycle::{StartOutcome, StartToken, StopReason, TeardownReason, VoiceEngine, VoiceEvent};
pub use session::{EngineSetup, VoiceCommand, VoiceSessionHandle};
