//! Signaling orchestrator
//!
//! Owns one `Link` per remote participant and drives the offer/answer/
//! candidate handshake over the messaging channel. The orchestrator does no
//! I/O of its own: outbound handshake messages collect in an outbox that the
//! caller drains into the channel, and the link backend reports progress as
//! `LinkEvent`s that the caller feeds back through `on_backend_event`.
//!
//! Only members (as passed to `reconcile`, `rejoin` or `add_member`) get
//! links. Handshake messages from identities not yet known are held in a
//! small buffer and replayed when they join; messages from members that
//! left are dropped.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use tabu_common::protocol::{
    AnswerMessage, CandidateMessage, ChannelMessage, IceCandidate, OfferMessage, SdpType,
    SessionDescription,
};

use crate::error::{SignalingError, TransportError};
use crate::signaling::backend::{LinkBackend, LinkEvent};
use crate::signaling::link::{ConnectionState, Link, SignalingState};

/// Restarts attempted before a link is left failed
pub const MAX_RESTARTS: u32 = 1;

/// Non-members whose handshake messages are held at once
const MAX_EARLY_REMOTES: usize = 8;

/// Held handshake messages per non-member (oldest dropped)
const MAX_EARLY_MESSAGES: usize = 16;

/// Link-level notifications for the lifecycle manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkNotice {
    StateChanged {
        remote: String,
        state: SignalingState,
    },
    /// Restart exhausted; the link stays failed
    Failed {
        remote: String,
        error: SignalingError,
    },
}

/// Per-remote handshake driver
pub struct Orchestrator {
    local: String,
    links: HashMap<String, Link>,
    members: HashSet<String>,
    /// Former members; their late handshake messages are dropped
    departed: HashSet<String>,
    /// Handshake messages from identities not yet members
    early: HashMap<String, VecDeque<ChannelMessage>>,
    backend: Box<dyn LinkBackend>,
    outbox: Vec<ChannelMessage>,
    notices: Vec<LinkNotice>,
    link_timeout: Duration,
}

impl Orchestrator {
    pub fn new(
        local: impl Into<String>,
        backend: Box<dyn LinkBackend>,
        link_timeout: Duration,
    ) -> Self {
        Self {
            local: local.into(),
            links: HashMap::new(),
            members: HashSet::new(),
            departed: HashSet::new(),
            early: HashMap::new(),
            backend,
            outbox: Vec::new(),
            notices: Vec::new(),
            link_timeout,
        }
    }

    pub fn local_identity(&self) -> &str {
        &self.local
    }

    pub fn link(&self, remote: &str) -> Option<&Link> {
        self.links.get(remote)
    }

    pub fn state(&self, remote: &str) -> Option<SignalingState> {
        self.links.get(remote).map(Link::state)
    }

    /// Participant-level connection state (Idle when no link exists)
    pub fn connection_state(&self, remote: &str) -> ConnectionState {
        self.state(remote)
            .map_or(ConnectionState::Idle, SignalingState::connection_state)
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn is_member(&self, remote: &str) -> bool {
        self.members.contains(remote)
    }

    /// Remotes whose link is usable for datagrams, sorted
    pub fn connected_remotes(&self) -> Vec<String> {
        let mut remotes: Vec<String> = self
            .links
            .values()
            .filter(|l| l.state == SignalingState::Connected)
            .map(|l| l.remote.clone())
            .collect();
        remotes.sort();
        remotes
    }

    pub fn drain_outbox(&mut self) -> Vec<ChannelMessage> {
        std::mem::take(&mut self.outbox)
    }

    pub fn drain_notices(&mut self) -> Vec<LinkNotice> {
        std::mem::take(&mut self.notices)
    }

    // =========================================================================
    // Membership
    // =========================================================================

    /// Bring the link set in line with the current members
    ///
    /// Members without a link get one (and are offered to when the local
    /// identity sorts lower). Links for identities no longer present close.
    pub fn reconcile<'a>(&mut self, members: impl IntoIterator<Item = &'a str>, now: Instant) {
        let mut members: Vec<&str> = members
            .into_iter()
            .filter(|m| *m != self.local)
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        members.sort_unstable();
        self.update_members(&members);

        let departed: Vec<String> = self
            .links
            .keys()
            .filter(|remote| !members.contains(&remote.as_str()))
            .cloned()
            .collect();
        for remote in departed {
            self.close(&remote);
        }

        for member in members {
            self.add_member(member, now);
        }
    }

    /// Reconcile after the local side closed all of its links
    ///
    /// Remotes may still consider their links usable, so the local side
    /// offers to every member regardless of identity order. Simultaneous
    /// offers resolve through the collision rule.
    pub fn rejoin<'a>(&mut self, members: impl IntoIterator<Item = &'a str>, now: Instant) {
        let members: Vec<&str> = members.into_iter().collect();
        self.update_members(&members);
        let departed: Vec<String> = self
            .links
            .keys()
            .filter(|remote| !members.contains(&remote.as_str()))
            .cloned()
            .collect();
        for remote in departed {
            self.close(&remote);
        }

        let mut fresh: Vec<&str> = members
            .into_iter()
            .filter(|m| *m != self.local && !self.links.contains_key(*m))
            .collect();
        fresh.sort_unstable();
        fresh.dedup();
        for remote in fresh {
            self.insert_link(remote);
            self.initiate(remote, false, now);
            self.replay_early(remote, now);
        }
    }

    /// Create a link for a newly joined member
    pub fn add_member(&mut self, remote: &str, now: Instant) {
        if remote == self.local {
            return;
        }
        self.departed.remove(remote);
        self.members.insert(remote.to_string());
        if self.links.contains_key(remote) {
            return;
        }
        self.insert_link(remote);
        if self.is_initiator(remote) {
            self.initiate(remote, false, now);
        }
        self.replay_early(remote, now);
    }

    /// Replace the member set, remembering who left
    fn update_members(&mut self, members: &[&str]) {
        let next: HashSet<String> = members
            .iter()
            .filter(|m| **m != self.local)
            .map(|m| m.to_string())
            .collect();
        for gone in self.members.difference(&next) {
            self.early.remove(gone);
            self.departed.insert(gone.clone());
        }
        for member in &next {
            self.departed.remove(member);
        }
        self.members = next;
    }

    /// Close the link to `remote` regardless of its state
    ///
    /// # Returns
    /// `true` if a link existed.
    pub fn close(&mut self, remote: &str) -> bool {
        let Some(mut link) = self.links.remove(remote) else {
            return false;
        };
        self.backend.close(remote);
        link.state = SignalingState::Closed;
        link.pending_candidates.clear();
        link.pending_remote_descriptors.clear();
        self.outbox.retain(|msg| addressed_to(msg) != Some(remote));
        tracing::debug!(remote, "link closed");
        self.notices.push(LinkNotice::StateChanged {
            remote: remote.to_string(),
            state: SignalingState::Closed,
        });
        true
    }

    /// Close every link and drop unsent handshake messages
    pub fn close_all(&mut self) {
        let remotes: Vec<String> = self.links.keys().cloned().collect();
        for remote in remotes {
            self.close(&remote);
        }
        self.outbox.clear();
    }

    // =========================================================================
    // Inbound Handshake Messages
    // =========================================================================

    /// Dispatch a channel message addressed to the local identity
    ///
    /// Messages from non-members are held until they join (or dropped if
    /// they already left) and count as handled.
    ///
    /// # Returns
    /// `Ok(true)` if the message was a handshake message for us,
    /// `Ok(false)` if it was ignored (not signaling, or not addressed to us).
    pub fn handle_message(
        &mut self,
        message: &ChannelMessage,
        now: Instant,
    ) -> Result<bool, SignalingError> {
        let Some((from, to)) = handshake_route(message) else {
            return Ok(false);
        };
        if !self.accepts(from, to) {
            return Ok(false);
        }
        if !self.members.contains(from) {
            self.hold_early(from, message);
            return Ok(true);
        }
        self.dispatch(message, now)?;
        Ok(true)
    }

    fn dispatch(&mut self, message: &ChannelMessage, now: Instant) -> Result<(), SignalingError> {
        match message {
            ChannelMessage::Offer(msg) => self.handle_offer(&msg.from_identity, &msg.offer, now),
            ChannelMessage::Answer(msg) => self.handle_answer(&msg.from_identity, &msg.answer, now),
            ChannelMessage::Candidate(msg) => {
                self.handle_candidate(&msg.from_identity, &msg.candidate, now)
            }
            _ => Ok(()),
        }
    }

    fn hold_early(&mut self, from: &str, message: &ChannelMessage) {
        if self.departed.contains(from) {
            tracing::debug!(
                remote = from,
                event = message.event_name(),
                "dropping handshake message from departed participant"
            );
            return;
        }
        if !self.early.contains_key(from) && self.early.len() >= MAX_EARLY_REMOTES {
            tracing::debug!(remote = from, "too many unknown senders, dropping handshake message");
            return;
        }
        let queue = self.early.entry(from.to_string()).or_default();
        if queue.len() >= MAX_EARLY_MESSAGES {
            queue.pop_front();
        }
        tracing::trace!(remote = from, event = message.event_name(), "holding handshake message");
        queue.push_back(message.clone());
    }

    fn replay_early(&mut self, remote: &str, now: Instant) {
        let Some(queued) = self.early.remove(remote) else {
            return;
        };
        tracing::debug!(remote, count = queued.len(), "replaying held handshake messages");
        for message in queued {
            if let Err(e) = self.dispatch(&message, now) {
                tracing::debug!(remote, error = %e, "held handshake message rejected");
            }
        }
    }

    /// Handle a remote offer
    fn handle_offer(
        &mut self,
        from: &str,
        offer: &SessionDescription,
        now: Instant,
    ) -> Result<(), SignalingError> {
        if offer.kind != SdpType::Offer {
            return Err(self.reject(from, "offer carried an answer descriptor", now));
        }
        if !self.links.contains_key(from) {
            // Member whose link was closed by a local teardown
            self.insert_link(from);
        }
        let Some(link) = self.links.get(from) else {
            return Err(SignalingError::UnknownLink(from.to_string()));
        };

        let state = link.state;
        if link.last_remote_sdp.as_deref() == Some(offer.sdp.as_str())
            && matches!(
                state,
                SignalingState::AnswerExchanged | SignalingState::Connected
            )
        {
            tracing::debug!(remote = from, "ignoring duplicate offer");
            return Ok(());
        }

        if state == SignalingState::OfferSent {
            if self.local.as_str() > from {
                tracing::debug!(remote = from, "offer collision, yielding to remote offer");
            } else {
                tracing::debug!(remote = from, "offer collision, keeping local offer");
                return Ok(());
            }
        }

        self.answer(from, offer, now);
        Ok(())
    }

    /// Handle a remote answer to our offer
    fn handle_answer(
        &mut self,
        from: &str,
        answer: &SessionDescription,
        now: Instant,
    ) -> Result<(), SignalingError> {
        if answer.kind != SdpType::Answer {
            return Err(self.reject(from, "answer carried an offer descriptor", now));
        }
        let Some(link) = self.links.get_mut(from) else {
            tracing::debug!(remote = from, "answer for unknown link");
            return Err(SignalingError::UnknownLink(from.to_string()));
        };

        match link.state {
            SignalingState::OfferSent => {
                self.apply_answer(from, answer, now);
                Ok(())
            }
            SignalingState::New => {
                tracing::debug!(remote = from, "queueing answer until local offer is recorded");
                link.pending_remote_descriptors.push_back(answer.clone());
                Ok(())
            }
            SignalingState::AnswerExchanged | SignalingState::Connected
                if link.last_remote_sdp.as_deref() == Some(answer.sdp.as_str()) =>
            {
                tracing::debug!(remote = from, "ignoring duplicate answer");
                Ok(())
            }
            state => {
                let error = SignalingError::Unexpected {
                    remote: from.to_string(),
                    message: "answer",
                    state: state.name(),
                };
                self.fail(from, error.clone(), now);
                Err(error)
            }
        }
    }

    /// Handle a remote candidate
    ///
    /// Candidates that arrive before the remote descriptor is applied are
    /// queued and applied once it is.
    fn handle_candidate(
        &mut self,
        from: &str,
        candidate: &IceCandidate,
        now: Instant,
    ) -> Result<(), SignalingError> {
        if candidate.candidate.trim().is_empty() {
            return Err(self.reject(from, "empty candidate", now));
        }
        if !self.links.contains_key(from) {
            self.insert_link(from);
        }
        let Some(link) = self.links.get_mut(from) else {
            return Err(SignalingError::UnknownLink(from.to_string()));
        };

        if !link.remote_applied {
            tracing::trace!(remote = from, "queueing early candidate");
            link.pending_candidates.push(candidate.clone());
            return Ok(());
        }

        if let Err(reason) = self.backend.add_remote_candidate(from, candidate) {
            let error = SignalingError::Backend {
                remote: from.to_string(),
                reason,
            };
            self.fail(from, error.clone(), now);
            return Err(error);
        }
        Ok(())
    }

    // =========================================================================
    // Backend Events and Timers
    // =========================================================================

    /// Apply a backend notification (datagrams are not handled here)
    pub fn on_backend_event(&mut self, event: &LinkEvent, now: Instant) {
        match event {
            LinkEvent::LocalCandidate { remote, candidate } => {
                if !self.links.contains_key(remote) {
                    return;
                }
                self.outbox
                    .push(ChannelMessage::Candidate(CandidateMessage {
                        candidate: candidate.clone(),
                        from_identity: self.local.clone(),
                        to_identity: remote.clone(),
                    }));
            }
            LinkEvent::Connected { remote } => {
                let Some(link) = self.links.get_mut(remote) else {
                    return;
                };
                if link.state != SignalingState::AnswerExchanged {
                    tracing::debug!(remote = %remote, state = %link.state, "ignoring stale connect");
                    return;
                }
                link.state = SignalingState::Connected;
                link.deadline = None;
                link.restarts = 0;
                tracing::info!(remote = %remote, "link connected");
                self.notices.push(LinkNotice::StateChanged {
                    remote: remote.clone(),
                    state: SignalingState::Connected,
                });
            }
            LinkEvent::Failed { remote, reason } => {
                let error = SignalingError::Backend {
                    remote: remote.clone(),
                    reason: reason.clone(),
                };
                self.fail(remote, error, now);
            }
            LinkEvent::Datagram { .. } => {}
        }
    }

    /// Fail links whose negotiation deadline passed
    pub fn tick(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .links
            .values()
            .filter(|l| l.deadline.is_some_and(|d| now >= d))
            .map(|l| l.remote.clone())
            .collect();
        for remote in expired {
            let error = SignalingError::Timeout {
                remote: remote.clone(),
                secs: self.link_timeout.as_secs(),
            };
            self.fail(&remote, error, now);
        }
    }

    /// Send a datagram over a connected link
    pub fn send_datagram(&mut self, remote: &str, datagram: &[u8]) -> Result<(), TransportError> {
        match self.state(remote) {
            Some(SignalingState::Connected) => self
                .backend
                .send(remote, datagram)
                .map_err(TransportError::Send),
            _ => Err(TransportError::Send(format!("no connected link to {remote}"))),
        }
    }

    // =========================================================================
    // Internal Transitions
    // =========================================================================

    fn accepts(&self, from: &str, to: &str) -> bool {
        to == self.local && from != self.local
    }

    /// The side whose identity sorts lower sends the first offer
    fn is_initiator(&self, remote: &str) -> bool {
        self.local.as_str() < remote
    }

    fn insert_link(&mut self, remote: &str) {
        tracing::debug!(remote, "link created");
        self.links.insert(remote.to_string(), Link::new(remote));
        self.notices.push(LinkNotice::StateChanged {
            remote: remote.to_string(),
            state: SignalingState::New,
        });
    }

    fn set_state(&mut self, remote: &str, state: SignalingState) {
        if let Some(link) = self.links.get_mut(remote) {
            link.state = state;
            self.notices.push(LinkNotice::StateChanged {
                remote: remote.to_string(),
                state,
            });
        }
    }

    /// Fail the link for a malformed message and build the error
    fn reject(&mut self, from: &str, reason: &str, now: Instant) -> SignalingError {
        let error = SignalingError::Malformed {
            remote: from.to_string(),
            reason: reason.to_string(),
        };
        self.fail(from, error.clone(), now);
        error
    }

    /// Send an offer (fresh session, or an ICE restart)
    fn initiate(&mut self, remote: &str, ice_restart: bool, now: Instant) {
        if !self.links.contains_key(remote) {
            return;
        }
        let offer = match self.backend.create_offer(remote, ice_restart) {
            Ok(offer) => offer,
            Err(reason) => {
                let error = SignalingError::Backend {
                    remote: remote.to_string(),
                    reason,
                };
                self.fail(remote, error, now);
                return;
            }
        };

        let deadline = now + self.link_timeout;
        let queued_answer = match self.links.get_mut(remote) {
            Some(link) => {
                if link.remote_applied {
                    link.reset_remote();
                }
                link.deadline = Some(deadline);
                link.pending_remote_descriptors.pop_front()
            }
            None => return,
        };
        tracing::debug!(remote, ice_restart, "sending offer");
        self.set_state(remote, SignalingState::OfferSent);
        self.outbox.push(ChannelMessage::Offer(OfferMessage {
            offer,
            from_identity: self.local.clone(),
            to_identity: remote.to_string(),
        }));

        if let Some(answer) = queued_answer {
            self.apply_answer(remote, &answer, now);
        }
    }

    /// Answer a remote offer
    fn answer(&mut self, from: &str, offer: &SessionDescription, now: Instant) {
        if let Some(link) = self.links.get_mut(from)
            && link.remote_applied
        {
            // Renegotiation: candidates of the previous round are stale
            link.reset_remote();
        }
        self.set_state(from, SignalingState::OfferReceived);

        let answer = match self.backend.create_answer(from, offer) {
            Ok(answer) => answer,
            Err(reason) => {
                let error = SignalingError::Backend {
                    remote: from.to_string(),
                    reason,
                };
                self.fail(from, error, now);
                return;
            }
        };

        if let Some(link) = self.links.get_mut(from) {
            link.remote_applied = true;
            link.last_remote_sdp = Some(offer.sdp.clone());
            link.deadline = Some(now + self.link_timeout);
        }
        tracing::debug!(remote = from, "sending answer");
        self.outbox.push(ChannelMessage::Answer(AnswerMessage {
            answer,
            from_identity: self.local.clone(),
            to_identity: from.to_string(),
        }));
        self.set_state(from, SignalingState::AnswerExchanged);
        self.flush_candidates(from, now);
    }

    fn apply_answer(&mut self, from: &str, answer: &SessionDescription, now: Instant) {
        if let Err(reason) = self.backend.set_remote_answer(from, answer) {
            let error = SignalingError::Backend {
                remote: from.to_string(),
                reason,
            };
            self.fail(from, error, now);
            return;
        }
        if let Some(link) = self.links.get_mut(from) {
            link.remote_applied = true;
            link.last_remote_sdp = Some(answer.sdp.clone());
        }
        self.set_state(from, SignalingState::AnswerExchanged);
        self.flush_candidates(from, now);
    }

    fn flush_candidates(&mut self, remote: &str, now: Instant) {
        let pending = match self.links.get_mut(remote) {
            Some(link) => std::mem::take(&mut link.pending_candidates),
            None => return,
        };
        if !pending.is_empty() {
            tracing::debug!(remote, count = pending.len(), "applying queued candidates");
        }
        for candidate in pending {
            if let Err(reason) = self.backend.add_remote_candidate(remote, &candidate) {
                let error = SignalingError::Backend {
                    remote: remote.to_string(),
                    reason,
                };
                self.fail(remote, error, now);
                return;
            }
        }
    }

    /// Move a link to Failed and restart it once
    fn fail(&mut self, remote: &str, error: SignalingError, now: Instant) {
        let restarts = match self.links.get_mut(remote) {
            Some(link) => {
                link.deadline = None;
                link.pending_remote_descriptors.clear();
                link.restarts
            }
            None => return,
        };
        tracing::warn!(remote, error = %error, restarts, "link failed");
        self.set_state(remote, SignalingState::Failed);

        if restarts < MAX_RESTARTS {
            if let Some(link) = self.links.get_mut(remote) {
                link.restarts += 1;
            }
            tracing::info!(remote, "restarting link");
            self.initiate(remote, true, now);
        } else {
            self.notices.push(LinkNotice::Failed {
                remote: remote.to_string(),
                error,
            });
        }
    }
}

/// `(from, to)` of a handshake message
fn handshake_route(message: &ChannelMessage) -> Option<(&str, &str)> {
    match message {
        ChannelMessage::Offer(m) => Some((&m.from_identity, &m.to_identity)),
        ChannelMessage::Answer(m) => Some((&m.from_identity, &m.to_identity)),
        ChannelMessage::Candidate(m) => Some((&m.from_identity, &m.to_identity)),
        _ => None,
    }
}

/// Remote a queued handshake message is addressed to
fn addressed_to(message: &ChannelMessage) -> Option<&str> {
    handshake_route(message).map(|(_, to)| to)
}

// =============================================================================
// Tests
// =============================================================================
