//! Messaging channel seam
//!
//! The voice engine exchanges handshake messages, relayed frames and room
//! updates over an injected channel. Connection changes and inbound
//! messages arrive as `ChannelEvent`s on a separate receiver.

mod loopback;
mod websocket;

pub use loopback::{LoopbackChannel, LoopbackHub};
pub use websocket::{WebSocketChannel, WebSocketConfig};

use tabu_common::protocol::ChannelMessage;

use crate::error::TransportError;

/// Outbound half of a messaging channel
pub trait MessagingChannel {
    /// Queue a message for delivery
    ///
    /// Fails with `TransportError::Disconnected` while the channel is down.
    fn send(&mut self, message: ChannelMessage) -> Result<(), TransportError>;

    fn is_connected(&self) -> bool;
}

/// Notifications from a messaging channel
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// Connected (or reconnected) and joined the room
    Connected,
    /// Connection dropped; the channel is reconnecting
    Disconnected,
    /// The channel gave up reconnecting
    ConnectionLost,
    /// Inbound message
    Message(ChannelMessage),
}
