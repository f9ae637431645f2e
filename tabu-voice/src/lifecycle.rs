//! Resource lifecycle manager
//!
//! `VoiceEngine` is the single owner of every voice resource for the local
//! participant: the capture session, the playback chains and output device,
//! the per-remote links and the outbound transport. It reacts to channel
//! events, link events, turn changes and its own cadence tick, and it is the
//! only place resources are acquired or released.
//!
//! Starting is split at the device acquisition point: `request_start`
//! issues a `StartToken` and `complete_start` acquires the microphone. Any
//! teardown or turn change in between invalidates the token.

use std::time::Instant;

use tokio::sync::mpsc;

use tabu_common::protocol::{ChannelMessage, MembershipChange};
use tabu_common::turn::{Roster, TurnContext, TurnPolicy};
use tabu_common::voice::{AudioFrame, CodecKind, MAX_IDENTITY_LEN};

use crate::channel::{ChannelEvent, MessagingChannel};
use crate::config::VoiceSettings;
use crate::error::{CaptureError, Result, SignalingError, TransportError, VoiceError};
use crate::signaling::{ConnectionState, LinkBackend, LinkEvent, LinkNotice, Orchestrator};
use crate::transport::{self, Outbound, Transport, TransportStrategy};
use crate::voice::capture::{CapturePipeline, CaptureStats};
use crate::voice::device::DeviceProvider;
use crate::voice::playback::PlaybackPipeline;

/// Encoded frames buffered between capture and transport
const FRAME_SINK_CAPACITY: usize = 4;

// =============================================================================
// Events
// =============================================================================

/// Why capture stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The local participant is no longer the speaker
    TurnEnded,
    /// The microphone failed
    DeviceError,
    /// Part of a full teardown
    TornDown,
}

/// Why all resources were released
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownReason {
    Requested,
    ChannelLost,
    Shutdown,
}

impl std::fmt::Display for TeardownReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TeardownReason::Requested => write!(f, "requested"),
            TeardownReason::ChannelLost => write!(f, "channel lost"),
            TeardownReason::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// Notifications for the UI
#[derive(Debug, Clone, PartialEq)]
pub enum VoiceEvent {
    CaptureStarted { codec: CodecKind },
    CaptureStopped { reason: StopReason },
    LinkStateChanged { remote: String, state: ConnectionState },
    LinkFailed { remote: String, error: SignalingError },
    TornDown { reason: TeardownReason },
    ChannelConnected,
    ChannelDisconnected,
    SpeakerChanged { speaker: Option<String> },
    Error(String),
}

// =============================================================================
// Start Tokens
// =============================================================================

/// Ticket for a pending capture start
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StartToken(u64);

/// Result of `request_start`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// Device acquisition should follow with `complete_start(token)`
    Pending(StartToken),
    /// A start is already in flight; nothing to do
    InFlight,
    /// Capture is already running
    AlreadyActive,
}

// =============================================================================
// Voice Engine
// =============================================================================

/// Single authority over the local participant's voice resources
pub struct VoiceEngine {
    identity: String,
    settings: VoiceSettings,
    turn: TurnContext,
    roster: Roster,
    capture: CapturePipeline,
    playback: PlaybackPipeline,
    transport: Box<dyn Transport>,
    links: Option<Orchestrator>,
    channel: Box<dyn MessagingChannel>,
    devices: Box<dyn DeviceProvider>,
    events: mpsc::UnboundedSender<VoiceEvent>,
    frame_tx: mpsc::Sender<AudioFrame>,
    frame_rx: mpsc::Receiver<AudioFrame>,
    pending_start: Option<StartToken>,
    next_token: u64,
    /// Links were closed locally; the next reconcile offers to everyone
    relink: bool,
    channel_down_since: Option<Instant>,
    speaker: Option<String>,
    frames_rejected: u64,
}

impl VoiceEngine {
    /// Create an engine for `identity`
    ///
    /// # Arguments
    /// * `identity` - Local participant identity
    /// * `settings` - Voice settings (strategy, devices, policy)
    /// * `channel` - Messaging channel to the room server
    /// * `devices` - Audio device provider
    /// * `link_backend` - Required for the direct strategy, ignored otherwise
    /// * `events` - Where `VoiceEvent`s are sent
    pub fn new(
        identity: impl Into<String>,
        settings: VoiceSettings,
        channel: Box<dyn MessagingChannel>,
        devices: Box<dyn DeviceProvider>,
        link_backend: Option<Box<dyn LinkBackend>>,
        events: mpsc::UnboundedSender<VoiceEvent>,
    ) -> Result<Self> {
        let identity = identity.into();
        if identity.is_empty() || identity.len() > MAX_IDENTITY_LEN {
            return Err(VoiceError::Config(format!(
                "identity must be 1-{MAX_IDENTITY_LEN} bytes"
            )));
        }

        let links = match (settings.transport, link_backend) {
            (TransportStrategy::Direct, Some(backend)) => Some(Orchestrator::new(
                identity.clone(),
                backend,
                settings.link_timeout(),
            )),
            (TransportStrategy::Direct, None) => {
                return Err(VoiceError::Config(
                    "direct transport needs a link backend".to_string(),
                ));
            }
            (TransportStrategy::Relay, _) => None,
        };

        let (frame_tx, frame_rx) = mpsc::channel(FRAME_SINK_CAPACITY);
        tracing::info!(identity = %identity, transport = %settings.transport, "voice engine ready");

        Ok(Self {
            capture: CapturePipeline::new(&settings),
            playback: PlaybackPipeline::new(
                identity.clone(),
                settings.output_device.clone(),
                settings.playback_gain,
            ),
            transport: transport::for_strategy(settings.transport, settings.backlog_frames),
            identity,
            settings,
            turn: TurnContext::default(),
            roster: Roster::new(),
            links,
            channel,
            devices,
            events,
            frame_tx,
            frame_rx,
            pending_start: None,
            next_token: 0,
            relink: false,
            channel_down_since: None,
            speaker: None,
            frames_rejected: 0,
        })
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn turn(&self) -> &TurnContext {
        &self.turn
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    pub fn is_capturing(&self) -> bool {
        self.capture.is_active()
    }

    pub fn is_start_pending(&self) -> bool {
        self.pending_start.is_some()
    }

    pub fn capture_stats(&self) -> CaptureStats {
        self.capture.stats()
    }

    pub fn playback(&self) -> &PlaybackPipeline {
        &self.playback
    }

    pub fn links(&self) -> Option<&Orchestrator> {
        self.links.as_ref()
    }

    /// Connection state of a remote participant
    ///
    /// With the relay strategy every room member is `Linked` while the
    /// messaging channel is up.
    pub fn connection_state(&self, remote: &str) -> ConnectionState {
        match self.links.as_ref() {
            Some(links) => links.connection_state(remote),
            None if self.channel.is_connected() && self.roster.contains(remote) => {
                ConnectionState::Linked
            }
            None => ConnectionState::Idle,
        }
    }

    /// Inbound frames discarded by the receive gate
    pub fn frames_rejected(&self) -> u64 {
        self.frames_rejected
    }

    fn policy(&self) -> TurnPolicy {
        self.settings.turn_policy
    }

    /// Whether the local identity may transmit right now
    pub fn can_transmit(&self) -> bool {
        self.policy()
            .can_transmit(&self.identity, &self.turn, &self.roster)
    }

    fn emit(&self, event: VoiceEvent) {
        let _ = self.events.send(event);
    }

    // =========================================================================
    // Start / Stop
    // =========================================================================

    /// Ask to start transmitting
    ///
    /// Fails with `NotSpeaker` unless the local identity is the effective
    /// speaker of an active turn.
    pub fn request_start(&mut self, now: Instant) -> Result<StartOutcome> {
        if self.capture.is_active() {
            return Ok(StartOutcome::AlreadyActive);
        }
        if self.pending_start.is_some() {
            tracing::debug!("start already in flight");
            return Ok(StartOutcome::InFlight);
        }
        if !self.can_transmit() {
            return Err(VoiceError::NotSpeaker(self.identity.clone()));
        }

        self.next_token += 1;
        let token = StartToken(self.next_token);
        self.pending_start = Some(token);
        self.reconcile_links(now);
        Ok(StartOutcome::Pending(token))
    }

    /// Acquire the microphone for a pending start
    ///
    /// # Returns
    /// `Ok(true)` if capture is running afterwards, `Ok(false)` if the
    /// token was stale and nothing was acquired.
    pub fn complete_start(&mut self, token: StartToken) -> Result<bool> {
        if self.pending_start != Some(token) {
            tracing::debug!(?token, "abandoning stale start");
            return Ok(false);
        }
        self.pending_start = None;

        if !self.can_transmit() {
            tracing::debug!(?token, "turn moved on before capture started");
            return Ok(false);
        }

        match self
            .capture
            .start(&self.identity, self.frame_tx.clone(), self.devices.as_mut())
        {
            Ok(()) => {
                let codec = self.capture.codec().unwrap_or_default();
                self.emit(VoiceEvent::CaptureStarted { codec });
                Ok(true)
            }
            Err(CaptureError::AlreadyRunning) => Ok(true),
            Err(e) => {
                tracing::warn!(error = %e, "failed to start capture");
                self.emit(VoiceEvent::Error(e.to_string()));
                Err(e.into())
            }
        }
    }

    /// Stop transmitting and release everything
    pub fn request_stop(&mut self) {
        self.teardown(TeardownReason::Requested);
    }

    /// Release everything before the engine is dropped
    pub fn shutdown(&mut self) {
        self.teardown(TeardownReason::Shutdown);
    }

    /// Full teardown: capture, links, playback and held frames
    fn teardown(&mut self, reason: TeardownReason) {
        let pending = self.pending_start.take().is_some();
        let captured = self.capture.stop();
        if captured {
            self.emit(VoiceEvent::CaptureStopped {
                reason: StopReason::TornDown,
            });
        }

        let had_links = self.links.as_ref().is_some_and(|l| !l.is_empty());
        if let Some(links) = self.links.as_mut() {
            links.close_all();
        }
        self.flush_links();
        if had_links {
            self.relink = true;
        }

        let had_playback = self.playback.has_output() || self.playback.chain_count() > 0;
        self.playback.teardown();
        self.transport.reset();
        while self.frame_rx.try_recv().is_ok() {}

        if pending || captured || had_links || had_playback {
            tracing::info!(%reason, "voice resources released");
            self.emit(VoiceEvent::TornDown { reason });
        }
    }

    // =========================================================================
    // Channel Events
    // =========================================================================

    pub fn on_channel_event(&mut self, event: ChannelEvent, now: Instant) {
        match event {
            ChannelEvent::Connected => {
                self.channel_down_since = None;
                self.emit(VoiceEvent::ChannelConnected);
                self.transport.on_channel_connected(self.channel.as_mut());
                self.reconcile_links(now);
                self.flush_links();
            }
            ChannelEvent::Disconnected => {
                self.channel_down_since.get_or_insert(now);
                tracing::warn!("messaging channel down");
                self.emit(VoiceEvent::ChannelDisconnected);
            }
            ChannelEvent::ConnectionLost => {
                self.channel_down_since = None;
                self.emit(VoiceEvent::ChannelDisconnected);
                self.teardown(TeardownReason::ChannelLost);
            }
            ChannelEvent::Message(message) => self.on_message(message, now),
        }
    }

    fn on_message(&mut self, message: ChannelMessage, now: Instant) {
        match message {
            ChannelMessage::Offer(_) | ChannelMessage::Answer(_) | ChannelMessage::Candidate(_) => {
                let Some(links) = self.links.as_mut() else {
                    tracing::trace!(event = message.event_name(), "ignoring handshake in relay mode");
                    return;
                };
                if let Err(e) = links.handle_message(&message, now) {
                    tracing::debug!(error = %e, "handshake message rejected");
                }
                self.flush_links();
            }
            ChannelMessage::AudioFrame(relayed) => {
                if self.settings.transport != TransportStrategy::Relay {
                    tracing::trace!("ignoring relayed frame in direct mode");
                    return;
                }
                let sender = relayed.sender_identity.clone();
                match transport::decode_relayed(relayed) {
                    Ok(frame) => self.receive_frame(&sender, frame, now),
                    Err(e) => tracing::debug!(error = %e, "dropping relayed frame"),
                }
            }
            ChannelMessage::Membership(update) => {
                match update.change {
                    MembershipChange::Joined => {
                        self.roster.join(update.identity.clone(), update.team);
                    }
                    MembershipChange::Left => {
                        self.roster.leave(&update.identity);
                        self.playback.remove_identity(&update.identity);
                    }
                }
                self.reconcile_links(now);
                self.on_gating_changed(now);
            }
            ChannelMessage::RoomUpdate(snapshot) => {
                let before: Vec<String> = self.roster.identities().map(str::to_string).collect();
                self.roster.apply_snapshot(snapshot.participants);
                for identity in before.iter().filter(|id| !self.roster.contains(id)) {
                    self.playback.remove_identity(identity);
                }
                self.reconcile_links(now);
                self.on_gating_changed(now);
            }
            ChannelMessage::TurnUpdate(turn) => {
                self.turn = turn;
                self.on_gating_changed(now);
            }
            ChannelMessage::JoinRoom(_) | ChannelMessage::LeaveRoom(_) => {}
        }
    }

    /// React to a turn or roster change
    ///
    /// Stops capture (keeping links and playback) once the local identity
    /// is no longer the speaker, and starts it when `auto_transmit` is set
    /// and it becomes the speaker.
    fn on_gating_changed(&mut self, now: Instant) {
        let speaker = self
            .policy()
            .effective_speaker(&self.turn, &self.roster)
            .map(str::to_string);
        if speaker != self.speaker {
            tracing::debug!(speaker = ?speaker, "speaker changed");
            self.speaker = speaker.clone();
            self.emit(VoiceEvent::SpeakerChanged { speaker });
        }

        if !self.can_transmit() {
            if self.pending_start.take().is_some() {
                tracing::debug!("pending start invalidated by turn change");
            }
            if self.capture.stop() {
                self.emit(VoiceEvent::CaptureStopped {
                    reason: StopReason::TurnEnded,
                });
            }
            while self.frame_rx.try_recv().is_ok() {}
            return;
        }

        if self.settings.auto_transmit
            && !self.capture.is_active()
            && self.pending_start.is_none()
            && let Ok(StartOutcome::Pending(token)) = self.request_start(now)
        {
            let _ = self.complete_start(token);
        }
    }

    // =========================================================================
    // Link Events
    // =========================================================================

    pub fn on_link_event(&mut self, event: LinkEvent, now: Instant) {
        if let LinkEvent::Datagram { remote, bytes } = &event {
            match transport::decode_datagram(remote, bytes) {
                Ok(Some(frame)) => self.receive_frame(remote, frame, now),
                Ok(None) => {}
                Err(e) => tracing::debug!(error = %e, "dropping datagram"),
            }
            return;
        }
        if let Some(links) = self.links.as_mut() {
            links.on_backend_event(&event, now);
        }
        self.flush_links();
    }

    /// Receive gate, then playback
    fn receive_frame(&mut self, from: &str, frame: AudioFrame, now: Instant) {
        let allowed = frame.sender_identity() == from
            && self
                .policy()
                .can_receive(&self.identity, from, &self.turn, &self.roster);
        if !allowed {
            self.frames_rejected += 1;
            tracing::trace!(sender = from, "frame rejected by receive gate");
            return;
        }

        match self
            .playback
            .on_frame(from, frame, self.devices.as_mut(), now)
        {
            Ok(played) => self.capture.feed_render(&played),
            Err(e) => {
                tracing::warn!(error = %e, "output device unavailable");
                self.emit(VoiceEvent::Error(e.to_string()));
            }
        }
    }

    // =========================================================================
    // Cadence
    // =========================================================================

    /// Run one frame interval
    pub fn tick(&mut self, now: Instant) {
        if let Err(e) = self.capture.tick() {
            self.emit(VoiceEvent::CaptureStopped {
                reason: StopReason::DeviceError,
            });
            self.emit(VoiceEvent::Error(e.to_string()));
        }

        self.send_captured();

        let played = self.playback.tick(now);
        if !played.is_empty() {
            self.capture.feed_render(&played);
        }
        if let Some(e) = self.playback.check_error() {
            tracing::warn!(error = %e, "output device failed");
            self.emit(VoiceEvent::Error(e.to_string()));
        }

        if let Some(links) = self.links.as_mut() {
            links.tick(now);
        }
        self.flush_links();

        if let Some(since) = self.channel_down_since
            && now.duration_since(since) >= self.settings.disconnect_grace()
        {
            tracing::warn!("messaging channel down past grace period");
            self.channel_down_since = None;
            self.teardown(TeardownReason::ChannelLost);
        }
    }

    /// Hand captured frames to the transport
    fn send_captured(&mut self) {
        while let Ok(frame) = self.frame_rx.try_recv() {
            if !self.can_transmit() {
                continue;
            }
            let recipients: Vec<String> = self
                .policy()
                .eligible_listeners(&self.turn, &self.roster)
                .into_iter()
                .filter(|id| *id != self.identity)
                .collect();

            let mut out = Outbound {
                channel: self.channel.as_mut(),
                links: self.links.as_mut(),
            };
            match self.transport.send(&frame, &recipients, &mut out) {
                Ok(_) => {}
                Err(TransportError::Disconnected) => {
                    tracing::trace!("channel down, frame held");
                }
                Err(e) => tracing::debug!(error = %e, "frame not sent"),
            }
        }
    }

    // =========================================================================
    // Links
    // =========================================================================

    fn reconcile_links(&mut self, now: Instant) {
        let Some(links) = self.links.as_mut() else {
            return;
        };
        if self.roster.is_empty() {
            return;
        }
        let members = self.roster.identities();
        if self.relink {
            links.rejoin(members, now);
            self.relink = false;
        } else {
            links.reconcile(members, now);
        }
        self.flush_links();
    }

    /// Send queued handshake messages and forward link notices
    fn flush_links(&mut self) {
        let Some(links) = self.links.as_mut() else {
            return;
        };
        if self.channel.is_connected() {
            for message in links.drain_outbox() {
                if let Err(e) = self.channel.send(message) {
                    tracing::debug!(error = %e, "handshake message not sent");
                }
            }
        }
        for notice in links.drain_notices() {
            let event = match notice {
                LinkNotice::StateChanged { remote, state } => VoiceEvent::LinkStateChanged {
                    remote,
                    state: state.connection_state(),
                },
                LinkNotice::Failed { remote, error } => VoiceEvent::LinkFailed { remote, error },
            };
            let _ = self.events.send(event);
        }
    }
}

impl Drop for VoiceEngine {
    fn drop(&mut self) {
        self.capture.stop();
        self.playback.teardown();
        if let Some(links) = self.links.as_mut() {
            links.close_all();
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DeviceError;
    use crate::testing::{TestRoom, drain_events};
    use crate::signaling::SignalingState;
    use tabu_common::turn::{Phase, TeamId};

    fn active(speaker: &str) -> TurnContext {
        TurnContext::active(TeamId::new("team1"), speaker)
    }

    fn room(strategy: TransportStrategy) -> TestRoom {
        TestRoom::new(
            strategy,
            &[
                ("ali", "team1"),
                ("veli", "team1"),
                ("ayse", "team2"),
                ("fatma", "team2"),
            ],
        )
    }

    #[test]
    fn test_start_rejected_when_not_speaker() {
        let mut room = room(TransportStrategy::Relay);
        let now = room.now();
        // Idle phase
        assert!(matches!(
            room.engine("ali").request_start(now),
            Err(VoiceError::NotSpeaker(_))
        ));

        room.set_turn(active("ali"));
        assert!(matches!(
            room.engine("veli").request_start(now),
            Err(VoiceError::NotSpeaker(_))
        ));
        assert!(matches!(
            room.engine("ayse").request_start(now),
            Err(VoiceError::NotSpeaker(_))
        ));

        let mut preparation = active("ali");
        preparation.phase = Phase::Preparation;
        room.set_turn(preparation);
        assert!(room.engine("ali").request_start(now).is_err());
        assert_eq!(room.devices("ali").capture_opened(), 0);
    }

    #[test]
    fn test_start_rejected_without_announced_speaker() {
        let mut room = room(TransportStrategy::Relay);
        room.set_turn(TurnContext {
            active_team: Some(TeamId::new("team1")),
            speaker_identity: None,
            phase: Phase::Active,
        });
        let now = room.now();

        for identity in ["ali", "veli", "ayse"] {
            assert!(matches!(
                room.engine(identity).request_start(now),
                Err(VoiceError::NotSpeaker(_))
            ));
            assert_eq!(room.devices(identity).capture_opened(), 0);
        }
    }

    #[test]
    fn test_start_is_idempotent() {
        let mut room = room(TransportStrategy::Relay);
        room.set_turn(active("ali"));
        let now = room.now();

        let engine = room.engine("ali");
        let StartOutcome::Pending(token) = engine.request_start(now).unwrap() else {
            panic!("expected pending start");
        };
        assert_eq!(engine.request_start(now).unwrap(), StartOutcome::InFlight);
        assert!(engine.complete_start(token).unwrap());
        assert_eq!(engine.request_start(now).unwrap(), StartOutcome::AlreadyActive);
        // Completing the same token again acquires nothing
        assert!(!engine.complete_start(token).unwrap());

        assert_eq!(room.devices("ali").capture_opened(), 1);
        assert_eq!(room.devices("ali").capture_live(), 1);
    }

    #[test]
    fn test_stop_is_idempotent_and_restart_works() {
        let mut room = room(TransportStrategy::Relay);
        room.set_turn(active("ali"));
        assert!(room.start("ali").unwrap());
        drain_events(room.events("ali"));

        room.engine("ali").request_stop();
        room.engine("ali").request_stop();
        let events = drain_events(room.events("ali"));
        let torn_down = events
            .iter()
            .filter(|e| matches!(e, VoiceEvent::TornDown { .. }))
            .count();
        assert_eq!(torn_down, 1);
        assert_eq!(room.devices("ali").capture_live(), 0);

        assert!(room.start("ali").unwrap());
        assert!(room.engine("ali").is_capturing());
        assert_eq!(room.devices("ali").capture_live(), 1);
    }

    #[test]
    fn test_listener_hears_every_frame_across_restart() {
        let mut room = room(TransportStrategy::Relay);
        room.set_turn(active("ali"));
        assert!(room.start("ali").unwrap());
        for _ in 0..5 {
            room.speak("ali", 0.4);
        }

        room.engine("ali").request_stop();
        room.pump();
        assert!(room.start("ali").unwrap());
        for _ in 0..3 {
            room.speak("ali", 0.4);
        }

        assert_eq!(room.engine_ref("veli").playback().frames_played("ali"), 8);
    }

    #[test]
    fn test_listener_hears_speaker_again_next_turn() {
        let mut room = room(TransportStrategy::Relay);
        room.set_turn(active("ali"));
        assert!(room.start("ali").unwrap());
        room.speak("ali", 0.4);
        room.speak("ali", 0.4);

        room.set_turn(active("veli"));
        assert!(room.start("veli").unwrap());
        room.speak("veli", 0.4);

        room.set_turn(active("ali"));
        assert!(room.start("ali").unwrap());
        room.speak("ali", 0.4);

        assert_eq!(room.engine_ref("veli").playback().frames_played("ali"), 3);
        assert_eq!(room.engine_ref("ali").playback().frames_played("veli"), 1);
    }

    #[test]
    fn test_teardown_invalidates_pending_start() {
        let mut room = room(TransportStrategy::Relay);
        room.set_turn(active("ali"));
        let now = room.now();

        let engine = room.engine("ali");
        let StartOutcome::Pending(token) = engine.request_start(now).unwrap() else {
            panic!("expected pending start");
        };
        engine.request_stop();
        assert!(!engine.complete_start(token).unwrap());
        assert!(!engine.is_capturing());
        assert_eq!(room.devices("ali").capture_opened(), 0);
    }

    #[test]
    fn test_turn_change_invalidates_pending_start() {
        let mut room = room(TransportStrategy::Relay);
        room.set_turn(active("ali"));
        let now = room.now();
        let StartOutcome::Pending(token) = room.engine("ali").request_start(now).unwrap() else {
            panic!("expected pending start");
        };

        room.set_turn(active("veli"));
        assert!(!room.engine("ali").complete_start(token).unwrap());
        assert_eq!(room.devices("ali").capture_opened(), 0);
    }

    #[test]
    fn test_device_failure_surfaces_and_retries() {
        let mut room = room(TransportStrategy::Relay);
        room.set_turn(active("ali"));
        room.devices("ali")
            .fail_next_capture(CaptureError::Device(DeviceError::PermissionDenied(
                "Mic".into(),
            )));

        assert!(matches!(
            room.start("ali"),
            Err(VoiceError::Capture(CaptureError::Device(_)))
        ));
        assert!(!room.engine("ali").is_capturing());
        assert_eq!(room.devices("ali").capture_live(), 0);
        let events = drain_events(room.events("ali"));
        assert!(events.iter().any(|e| matches!(e, VoiceEvent::Error(_))));

        assert!(room.start("ali").unwrap());
    }

    #[test]
    fn test_relay_end_to_end() {
        let mut room = room(TransportStrategy::Relay);
        room.set_turn(active("ali"));
        assert!(room.start("ali").unwrap());

        room.speak("ali", 0.4);
        room.speak("ali", 0.4);

        // Teammate hears, the other team and the speaker do not
        assert_eq!(room.engine_ref("veli").playback().frames_played("ali"), 2);
        assert!(room.devices("veli").heard("ali") > 0);
        assert_eq!(room.devices("ayse").heard("ali"), 0);
        assert_eq!(room.devices("fatma").heard("ali"), 0);
        assert_eq!(room.devices("ali").heard("ali"), 0);
        assert_eq!(room.devices("ali").playback_opened(), 0);
        assert!(room.engine_ref("ayse").frames_rejected() > 0);
        assert_eq!(room.hub().relayed_frames(), 2);
    }

    #[test]
    fn test_relay_connection_state_follows_channel() {
        let mut room = room(TransportStrategy::Relay);
        assert_eq!(
            room.engine_ref("ali").connection_state("veli"),
            ConnectionState::Linked
        );
        assert_eq!(
            room.engine_ref("ali").connection_state("nobody"),
            ConnectionState::Idle
        );

        room.hub().disconnect("ali");
        room.pump();
        assert_eq!(
            room.engine_ref("ali").connection_state("veli"),
            ConnectionState::Idle
        );
    }

    #[test]
    fn test_silence_is_not_sent() {
        let mut room = room(TransportStrategy::Relay);
        room.set_turn(active("ali"));
        assert!(room.start("ali").unwrap());

        room.speak("ali", 0.0);
        room.speak("ali", 0.01);
        assert_eq!(room.hub().relayed_frames(), 0);
        assert_eq!(room.engine_ref("ali").capture_stats().frames_gated, 2);
    }

    #[test]
    fn test_turn_end_stops_capture_but_keeps_listening() {
        let mut room = room(TransportStrategy::Relay);
        room.set_turn(active("ali"));
        assert!(room.start("ali").unwrap());
        room.speak("ali", 0.4);
        drain_events(room.events("ali"));

        room.set_turn(active("veli"));
        assert!(!room.engine("ali").is_capturing());
        assert_eq!(room.devices("ali").capture_live(), 0);
        let events = drain_events(room.events("ali"));
        assert!(events.contains(&VoiceEvent::CaptureStopped {
            reason: StopReason::TurnEnded
        }));
        assert!(events.contains(&VoiceEvent::SpeakerChanged {
            speaker: Some("veli".into())
        }));

        // veli kept its playback; ali now hears veli
        assert!(room.engine_ref("veli").playback().has_output());
        assert!(room.start("veli").unwrap());
        room.speak("veli", 0.3);
        assert!(room.devices("ali").heard("veli") > 0);
    }

    #[test]
    fn test_auto_transmit_starts_on_turn() {
        let mut room = TestRoom::with_settings(
            TransportStrategy::Relay,
            &[("ali", "team1"), ("veli", "team1")],
            |settings| settings.auto_transmit = true,
        );
        room.set_turn(active("ali"));
        assert!(room.engine("ali").is_capturing());
        assert!(!room.engine("veli").is_capturing());

        room.set_turn(TurnContext::default());
        assert!(!room.engine("ali").is_capturing());
    }

    #[test]
    fn test_channel_loss_releases_playback() {
        let mut room = room(TransportStrategy::Relay);
        room.set_turn(active("ali"));
        assert!(room.start("ali").unwrap());
        room.speak("ali", 0.4);
        assert!(room.engine_ref("veli").playback().has_output());

        room.hub().lose_connection("veli");
        room.pump();
        assert!(!room.engine_ref("veli").playback().has_output());
        assert_eq!(room.engine_ref("veli").playback().chain_count(), 0);
        assert_eq!(room.devices("veli").playback_live(), 0);
        let events = drain_events(room.events("veli"));
        assert!(events.contains(&VoiceEvent::TornDown {
            reason: TeardownReason::ChannelLost
        }));
    }

    #[test]
    fn test_transient_disconnect_holds_frames() {
        let mut room = room(TransportStrategy::Relay);
        room.set_turn(active("ali"));
        assert!(room.start("ali").unwrap());

        room.hub().disconnect("ali");
        room.pump();
        room.speak("ali", 0.4);
        room.speak("ali", 0.4);
        assert!(room.engine_ref("ali").is_capturing());
        assert_eq!(room.hub().relayed_frames(), 0);

        room.hub().reconnect("ali");
        room.pump();
        assert_eq!(room.hub().relayed_frames(), 2);
        assert_eq!(room.engine_ref("veli").playback().frames_played("ali"), 2);
    }

    #[test]
    fn test_disconnect_past_grace_tears_down() {
        let mut room = room(TransportStrategy::Relay);
        room.set_turn(active("ali"));
        assert!(room.start("ali").unwrap());

        room.hub().disconnect("ali");
        room.pump();
        let grace = room.engine_ref("ali").settings.disconnect_grace();
        room.advance(grace);
        room.tick();
        assert!(!room.engine("ali").is_capturing());
        assert_eq!(room.devices("ali").capture_live(), 0);
    }

    #[test]
    fn test_direct_links_form_and_carry_audio() {
        let mut room = room(TransportStrategy::Direct);
        for (a, b) in [("ali", "veli"), ("ali", "ayse"), ("veli", "fatma")] {
            assert_eq!(
                room.engine_ref(a).links().unwrap().state(b),
                Some(SignalingState::Connected)
            );
            assert_eq!(
                room.engine_ref(b).connection_state(a),
                ConnectionState::Linked
            );
        }

        room.set_turn(active("ali"));
        assert!(room.start("ali").unwrap());
        room.speak("ali", 0.4);

        assert_eq!(room.engine_ref("veli").playback().frames_played("ali"), 1);
        assert_eq!(room.devices("ayse").heard("ali"), 0);
        assert_eq!(room.devices("ali").heard("ali"), 0);
        // Only the eligible listener was sent a datagram
        assert_eq!(room.network().datagrams_from("ali"), 1);
        assert_eq!(room.hub().relayed_frames(), 0);
    }

    #[test]
    fn test_direct_failure_isolated_per_link() {
        let mut room = room(TransportStrategy::Direct);
        let now = room.now();
        room.engine("ali").on_link_event(
            LinkEvent::Failed {
                remote: "ayse".into(),
                reason: "ice failed".into(),
            },
            now,
        );
        room.pump();
        // Restarted and reconnected; the other links never moved
        assert_eq!(
            room.engine_ref("ali").links().unwrap().state("ayse"),
            Some(SignalingState::Connected)
        );
        assert_eq!(
            room.engine_ref("ali").links().unwrap().state("veli"),
            Some(SignalingState::Connected)
        );

        room.set_turn(active("ali"));
        assert!(room.start("ali").unwrap());
        room.speak("ali", 0.4);
        assert_eq!(room.engine_ref("veli").playback().frames_played("ali"), 1);
    }

    #[test]
    fn test_direct_teardown_closes_links_and_relinks() {
        let mut room = room(TransportStrategy::Direct);
        room.set_turn(active("ali"));
        assert!(room.start("ali").unwrap());

        room.engine("ali").request_stop();
        room.pump();
        assert!(room.engine_ref("ali").links().unwrap().is_empty());
        assert_eq!(room.devices("ali").capture_live(), 0);

        assert!(room.start("ali").unwrap());
        assert_eq!(
            room.engine_ref("ali").links().unwrap().state("veli"),
            Some(SignalingState::Connected)
        );
        room.speak("ali", 0.4);
        assert_eq!(room.engine_ref("veli").playback().frames_played("ali"), 1);
    }

    #[test]
    fn test_member_departure_cleans_up() {
        let mut room = room(TransportStrategy::Direct);
        room.set_turn(active("ali"));
        assert!(room.start("ali").unwrap());
        room.speak("ali", 0.4);
        assert!(room.engine_ref("veli").playback().has_chain("ali"));

        room.leave("ali");
        assert!(!room.engine_ref("veli").playback().has_chain("ali"));
        assert!(room.engine_ref("veli").links().unwrap().link("ali").is_none());
    }

    #[test]
    fn test_direct_requires_backend() {
        let (events, _rx) = mpsc::unbounded_channel();
        let settings = VoiceSettings {
            transport: TransportStrategy::Direct,
            ..Default::default()
        };
        let result = VoiceEngine::new(
            "ali",
            settings,
            Box::new(crate::testing::RecordingChannel::connected()),
            Box::new(crate::testing::FakeDevices::new().provider()),
            None,
            events,
        );
        assert!(matches!(result, Err(VoiceError::Config(_))));
    }
}
