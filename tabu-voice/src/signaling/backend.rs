//! Link backend seam
//!
//! The orchestrator drives the handshake; a backend owns the actual
//! transport per remote (sockets, DTLS). Operations return immediately and
//! progress is reported as `LinkEvent`s on the backend's event channel.

use tabu_common::protocol::{IceCandidate, SessionDescription};

/// Asynchronous notifications from a link backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// A local candidate to advertise to the remote
    LocalCandidate {
        remote: String,
        candidate: IceCandidate,
    },
    /// The link to `remote` is usable
    Connected { remote: String },
    /// The link to `remote` failed (handshake or transport)
    Failed { remote: String, reason: String },
    /// A datagram arrived from `remote`
    Datagram { remote: String, bytes: Vec<u8> },
}

impl LinkEvent {
    pub fn remote(&self) -> &str {
        match self {
            LinkEvent::LocalCandidate { remote, .. }
            | LinkEvent::Connected { remote }
            | LinkEvent::Failed { remote, .. }
            | LinkEvent::Datagram { remote, .. } => remote,
        }
    }
}

/// Per-remote transport driven by the orchestrator
pub trait LinkBackend {
    /// Prepare a new local session and describe it
    ///
    /// `ice_restart` is set when renegotiating a failed link.
    fn create_offer(
        &mut self,
        remote: &str,
        ice_restart: bool,
    ) -> Result<SessionDescription, String>;

    /// Apply a remote offer and describe the local answering session
    fn create_answer(
        &mut self,
        remote: &str,
        offer: &SessionDescription,
    ) -> Result<SessionDescription, String>;

    /// Apply the remote answer to our offer
    fn set_remote_answer(&mut self, remote: &str, answer: &SessionDescription)
    -> Result<(), String>;

    /// Apply a remote candidate (only after the remote descriptor)
    fn add_remote_candidate(&mut self, remote: &str, candidate: &IceCandidate)
    -> Result<(), String>;

    /// Send a datagram over an established link
    fn send(&mut self, remote: &str, datagram: &[u8]) -> Result<(), String>;

    /// Release everything held for `remote`
    fn close(&mut self, remote: &str);
}
