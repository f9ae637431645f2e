//! In-process messaging hub
//!
//! Routes messages between channels in the same process the way the room
//! server does: handshake messages go to their addressee, relayed frames
//! fan out to everyone else, and room/turn updates are broadcast by the hub
//! itself.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use tabu_common::protocol::ChannelMessage;

use crate::channel::{ChannelEvent, MessagingChannel};
use crate::error::TransportError;

struct Member {
    events: mpsc::UnboundedSender<ChannelEvent>,
    connected: bool,
}

#[derive(Default)]
struct HubState {
    members: HashMap<String, Member>,
    relayed_frames: u64,
}

/// Shared in-memory room
#[derive(Clone, Default)]
pub struct LoopbackHub {
    state: Arc<Mutex<HubState>>,
}

impl LoopbackHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach an identity and return its channel
    ///
    /// The receiver gets `ChannelEvent::Connected` immediately.
    pub fn connect(
        &self,
        identity: impl Into<String>,
    ) -> (LoopbackChannel, mpsc::UnboundedReceiver<ChannelEvent>) {
        let identity = identity.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(ChannelEvent::Connected);
        if let Ok(mut state) = self.state.lock() {
            state.members.insert(
                identity.clone(),
                Member {
                    events: tx,
                    connected: true,
                },
            );
        }
        let channel = LoopbackChannel {
            identity,
            hub: self.clone(),
        };
        (channel, rx)
    }

    /// Deliver a server-originated message to every connected member
    pub fn broadcast(&self, message: ChannelMessage) {
        if let Ok(state) = self.state.lock() {
            for member in state.members.values().filter(|m| m.connected) {
                let _ = member.events.send(ChannelEvent::Message(message.clone()));
            }
        }
    }

    /// Simulate a transient connection drop for `identity`
    pub fn disconnect(&self, identity: &str) {
        self.set_connection(identity, false, ChannelEvent::Disconnected);
    }

    /// Simulate a successful reconnect for `identity`
    pub fn reconnect(&self, identity: &str) {
        self.set_connection(identity, true, ChannelEvent::Connected);
    }

    /// Simulate the channel giving up for `identity`
    pub fn lose_connection(&self, identity: &str) {
        self.set_connection(identity, false, ChannelEvent::ConnectionLost);
    }

    pub fn is_connected(&self, identity: &str) -> bool {
        self.state
            .lock()
            .map(|s| s.members.get(identity).is_some_and(|m| m.connected))
            .unwrap_or(false)
    }

    /// Frames fanned out so far
    pub fn relayed_frames(&self) -> u64 {
        self.state.lock().map(|s| s.relayed_frames).unwrap_or(0)
    }

    fn set_connection(&self, identity: &str, connected: bool, event: ChannelEvent) {
        if let Ok(mut state) = self.state.lock()
            && let Some(member) = state.members.get_mut(identity)
        {
            member.connected = connected;
            let _ = member.events.send(event);
        }
    }

    fn route(&self, from: &str, message: ChannelMessage) -> Result<(), TransportError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| TransportError::Send("loopback hub poisoned".to_string()))?;
        if !state.members.get(from).is_some_and(|m| m.connected) {
            return Err(TransportError::Disconnected);
        }

        let addressee = match &message {
            ChannelMessage::Offer(m) => Some(m.to_identity.clone()),
            ChannelMessage::Answer(m) => Some(m.to_identity.clone()),
            ChannelMessage::Candidate(m) => Some(m.to_identity.clone()),
            ChannelMessage::JoinRoom(_) | ChannelMessage::LeaveRoom(_) => return Ok(()),
            _ => None,
        };

        match addressee {
            Some(to) => {
                if let Some(member) = state.members.get(&to).filter(|m| m.connected) {
                    let _ = member.events.send(ChannelEvent::Message(message));
                } else {
                    tracing::trace!(from, to = %to, "dropping message for absent member");
                }
            }
            None => {
                if matches!(message, ChannelMessage::AudioFrame(_)) {
                    state.relayed_frames += 1;
                }
                for (identity, member) in &state.members {
                    if identity != from && member.connected {
                        let _ = member.events.send(ChannelEvent::Message(message.clone()));
                    }
                }
            }
        }
        Ok(())
    }
}

/// One participant's handle on a `LoopbackHub`
pub struct LoopbackChannel {
    identity: String,
    hub: LoopbackHub,
}

impl LoopbackChannel {
    pub fn identity(&self) -> &str {
        &self.identity
    }
}

impl MessagingChannel for LoopbackChannel {
    fn send(&mut self, message: ChannelMessage) -> Result<(), TransportError> {
        self.hub.route(&self.identity, message)
    }

    fn is_connected(&self) -> bool {
        self.hub.is_connected(&self.identity)
    }
}

// =============================================================================
// Tests
// =============================================================================
