//! Per-remote link state

use std::collections::VecDeque;
use std::time::Instant;

use serde::Serialize;
use tabu_common::protocol::{IceCandidate, SessionDescription};

/// Handshake state of one link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SignalingState {
    New,
    OfferSent,
    OfferReceived,
    AnswerExchanged,
    Connected,
    Failed,
    Closed,
}

impl SignalingState {
    pub fn name(self) -> &'static str {
        match self {
            SignalingState::New => "New",
            SignalingState::OfferSent => "OfferSent",
            SignalingState::OfferReceived => "OfferReceived",
            SignalingState::AnswerExchanged => "AnswerExchanged",
            SignalingState::Connected => "Connected",
            SignalingState::Failed => "Failed",
            SignalingState::Closed => "Closed",
        }
    }

    /// Participant-level view of this state
    pub fn connection_state(self) -> ConnectionState {
        match self {
            SignalingState::New | SignalingState::Closed => ConnectionState::Idle,
            SignalingState::OfferSent
            | SignalingState::OfferReceived
            | SignalingState::AnswerExchanged => ConnectionState::Linking,
            SignalingState::Connected => ConnectionState::Linked,
            SignalingState::Failed => ConnectionState::Failed,
        }
    }
}

impl std::fmt::Display for SignalingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Connection state of a participant as shown to the UI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ConnectionState {
    Idle,
    Linking,
    Linked,
    Failed,
}

/// Link to one remote participant
#[derive(Debug)]
pub struct Link {
    pub(crate) remote: String,
    pub(crate) state: SignalingState,
    /// Remote descriptors that arrived before we could apply them
    pub(crate) pending_remote_descriptors: VecDeque<SessionDescription>,
    /// Remote candidates that arrived before the remote descriptor
    pub(crate) pending_candidates: Vec<IceCandidate>,
    /// Whether the current remote descriptor has been applied
    pub(crate) remote_applied: bool,
    /// Last remote sdp applied (for duplicate detection)
    pub(crate) last_remote_sdp: Option<String>,
    /// Restarts attempted since the last successful connection
    pub(crate) restarts: u32,
    /// Negotiation deadline (None once connected)
    pub(crate) deadline: Option<Instant>,
}

impl Link {
    pub(crate) fn new(remote: impl Into<String>) -> Self {
        Self {
            remote: remote.into(),
            state: SignalingState::New,
            pending_remote_descriptors: VecDeque::new(),
            pending_candidates: Vec::new(),
            remote_applied: false,
            last_remote_sdp: None,
            restarts: 0,
            deadline: None,
        }
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    pub fn state(&self) -> SignalingState {
        self.state
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    pub fn pending_remote_descriptors(&self) -> usize {
        self.pending_remote_descriptors.len()
    }

    pub fn restarts(&self) -> u32 {
        self.restarts
    }

    /// Forget the remote side of the handshake (new negotiation round)
    pub(crate) fn reset_remote(&mut self) {
        self.remote_applied = false;
        self.last_remote_sdp = None;
        self.pending_candidates.clear();
    }
}
