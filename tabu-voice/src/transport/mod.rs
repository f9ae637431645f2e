//! Frame delivery
//!
//! Two mutually exclusive strategies, chosen per deployment:
//! - `Relay`: frames travel as `audioFrame` messages over the messaging
//!   channel and the room server fans them out
//! - `Direct`: frames travel as binary `FramePacket`s over each recipient's
//!   connected link
//!
//! Delivery is best effort; lost frames are never retransmitted.

mod direct;
mod relay;

pub use direct::{DirectTransport, decode_datagram};
pub use relay::{RelayTransport, decode_relayed};

use serde::{Deserialize, Serialize};
use tabu_common::voice::AudioFrame;

use crate::channel::MessagingChannel;
use crate::error::TransportError;
use crate::signaling::Orchestrator;

/// Frame delivery strategy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportStrategy {
    #[default]
    Relay,
    Direct,
}

impl TransportStrategy {
    pub fn all() -> &'static [TransportStrategy] {
        &[TransportStrategy::Relay, TransportStrategy::Direct]
    }

    /// Whether this strategy needs per-remote links
    pub fn uses_links(self) -> bool {
        self == TransportStrategy::Direct
    }
}

impl std::fmt::Display for TransportStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportStrategy::Relay => write!(f, "relay"),
            TransportStrategy::Direct => write!(f, "direct"),
        }
    }
}

impl std::str::FromStr for TransportStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "relay" => Ok(TransportStrategy::Relay),
            "direct" => Ok(TransportStrategy::Direct),
            other => Err(format!("unknown transport strategy: {other}")),
        }
    }
}

/// Paths a frame can leave by
pub struct Outbound<'a> {
    pub channel: &'a mut dyn MessagingChannel,
    pub links: Option<&'a mut Orchestrator>,
}

/// Outbound frame delivery
pub trait Transport {
    fn strategy(&self) -> TransportStrategy;

    /// Deliver a frame to `recipients`
    ///
    /// # Returns
    /// Number of sends performed (0 when there is nobody to deliver to).
    fn send(
        &mut self,
        frame: &AudioFrame,
        recipients: &[String],
        out: &mut Outbound<'_>,
    ) -> Result<usize, TransportError>;

    /// The messaging channel came back; deliver anything held
    ///
    /// # Returns
    /// Number of held frames delivered.
    fn on_channel_connected(&mut self, channel: &mut dyn MessagingChannel) -> usize;

    /// Drop anything held
    fn reset(&mut self);
}

/// Build the transport for a strategy
pub fn for_strategy(strategy: TransportStrategy, backlog_frames: usize) -> Box<dyn Transport> {
    match strategy {
        TransportStrategy::Relay => Box::new(RelayTransport::new(backlog_frames)),
        TransportStrategy::Direct => Box::new(DirectTransport::new()),
    }
}
