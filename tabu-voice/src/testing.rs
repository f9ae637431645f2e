//! In-memory fakes for unit tests
//!
//! Devices, link backends and channels that record what was done to them,
//! plus a `TestRoom` that wires several engines together through a
//! `LoopbackHub` and a shared fake link network.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use tabu_common::protocol::{
    AnswerMessage, ChannelMessage, IceCandidate, MembershipChange, MembershipUpdate,
    OfferMessage, RoomSnapshot, SessionDescription,
};
use tabu_common::turn::{RosterEntry, TeamId, TurnContext};
use tabu_common::voice::{CodecKind, VOICE_FRAME_DURATION_MS, VOICE_SAMPLES_PER_FRAME};

use crate::channel::{ChannelEvent, LoopbackHub, MessagingChannel};
use crate::config::VoiceSettings;
use crate::error::{CaptureError, DeviceError, Result, TransportError};
use crate::lifecycle::{StartOutcome, VoiceEngine, VoiceEvent};
use crate::signaling::{LinkBackend, LinkEvent, Orchestrator, SignalingState};
use crate::transport::TransportStrategy;
use crate::voice::device::{CaptureDevice, DeviceProvider, PlaybackDevice};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// =============================================================================
// Devices
// =============================================================================

#[derive(Default)]
struct DeviceState {
    capture_queue: VecDeque<Vec<f32>>,
    capture_opened: usize,
    capture_live: usize,
    capture_started: bool,
    fail_capture: Option<CaptureError>,
    capture_error: Option<DeviceError>,
    playback_opened: usize,
    playback_live: usize,
    queued: HashMap<String, usize>,
    heard: HashMap<String, usize>,
    fail_playback: Option<DeviceError>,
    playback_error: Option<DeviceError>,
}

/// Shared handle on fake microphone and speaker state
#[derive(Clone, Default)]
pub struct FakeDevices {
    state: Arc<Mutex<DeviceState>>,
}

impl FakeDevices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn provider(&self) -> FakeProvider {
        FakeProvider {
            devices: self.clone(),
        }
    }

    /// Queue one frame of microphone samples
    pub fn push_capture(&self, samples: Vec<f32>) {
        lock(&self.state).capture_queue.push_back(samples);
    }

    pub fn pending_capture(&self) -> usize {
        lock(&self.state).capture_queue.len()
    }

    pub fn capture_opened(&self) -> usize {
        lock(&self.state).capture_opened
    }

    /// Capture devices opened and not yet dropped
    pub fn capture_live(&self) -> usize {
        lock(&self.state).capture_live
    }

    pub fn fail_next_capture(&self, error: CaptureError) {
        lock(&self.state).fail_capture = Some(error);
    }

    pub fn inject_capture_error(&self, error: DeviceError) {
        lock(&self.state).capture_error = Some(error);
    }

    pub fn playback_opened(&self) -> usize {
        lock(&self.state).playback_opened
    }

    pub fn playback_live(&self) -> usize {
        lock(&self.state).playback_live
    }

    /// Samples currently buffered for a source
    pub fn queued_samples(&self, source: &str) -> usize {
        lock(&self.state).queued.get(source).copied().unwrap_or(0)
    }

    /// Samples ever queued for a source
    pub fn heard(&self, source: &str) -> usize {
        lock(&self.state).heard.get(source).copied().unwrap_or(0)
    }

    pub fn fail_next_playback(&self, error: DeviceError) {
        lock(&self.state).fail_playback = Some(error);
    }

    pub fn inject_playback_error(&self, error: DeviceError) {
        lock(&self.state).playback_error = Some(error);
    }
}

pub struct FakeProvider {
    devices: FakeDevices,
}

impl DeviceProvider for FakeProvider {
    fn open_capture(&mut self, _device_name: &str) -> std::result::Result<Box<dyn CaptureDevice>, CaptureError> {
        let mut state = lock(&self.devices.state);
        if let Some(error) = state.fail_capture.take() {
            return Err(error);
        }
        state.capture_opened += 1;
        state.capture_live += 1;
        Ok(Box::new(FakeCapture {
            devices: self.devices.clone(),
        }))
    }

    fn open_playback(
        &mut self,
        _device_name: &str,
    ) -> std::result::Result<Box<dyn PlaybackDevice>, DeviceError> {
        let mut state = lock(&self.devices.state);
        if let Some(error) = state.fail_playback.take() {
            return Err(error);
        }
        state.playback_opened += 1;
        state.playback_live += 1;
        Ok(Box::new(FakePlayback {
            devices: self.devices.clone(),
        }))
    }
}

struct FakeCapture {
    devices: FakeDevices,
}

impl CaptureDevice for FakeCapture {
    fn start(&mut self) -> std::result::Result<(), DeviceError> {
        lock(&self.devices.state).capture_started = true;
        Ok(())
    }

    fn take_frame(&mut self) -> Option<Vec<f32>> {
        let mut state = lock(&self.devices.state);
        if !state.capture_started {
            return None;
        }
        state.capture_queue.pop_front()
    }

    fn pending_frames(&self) -> usize {
        let state = lock(&self.devices.state);
        if state.capture_started {
            state.capture_queue.len()
        } else {
            0
        }
    }

    fn check_error(&mut self) -> Option<DeviceError> {
        lock(&self.devices.state).capture_error.take()
    }

    fn stop(&mut self) {
        let mut state = lock(&self.devices.state);
        state.capture_started = false;
        state.capture_queue.clear();
    }
}

impl Drop for FakeCapture {
    fn drop(&mut self) {
        let mut state = lock(&self.devices.state);
        state.capture_live = state.capture_live.saturating_sub(1);
        state.capture_started = false;
    }
}

struct FakePlayback {
    devices: FakeDevices,
}

impl PlaybackDevice for FakePlayback {
    fn start(&mut self) -> std::result::Result<(), DeviceError> {
        Ok(())
    }

    fn queue_audio(&mut self, source: &str, samples: &[f32]) {
        let mut state = lock(&self.devices.state);
        *state.queued.entry(source.to_string()).or_default() += samples.len();
        *state.heard.entry(source.to_string()).or_default() += samples.len();
    }

    fn remove_source(&mut self, source: &str) {
        lock(&self.devices.state).queued.remove(source);
    }

    fn clear(&mut self) {
        lock(&self.devices.state).queued.clear();
    }

    fn check_error(&mut self) -> Option<DeviceError> {
        lock(&self.devices.state).playback_error.take()
    }
}

impl Drop for FakePlayback {
    fn drop(&mut self) {
        let mut state = lock(&self.devices.state);
        state.playback_live = state.playback_live.saturating_sub(1);
    }
}

// =============================================================================
// Link Backend
// =============================================================================

#[derive(Default)]
struct NetworkState {
    queues: HashMap<String, VecDeque<LinkEvent>>,
    datagrams_from: HashMap<String, usize>,
}

/// Event queues shared by every `FakeBackend` of a test room
#[derive(Clone, Default)]
pub struct FakeLinkNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl FakeLinkNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn backend(&self, local: &str) -> FakeBackend {
        FakeBackend {
            local: local.to_string(),
            network: self.clone(),
            state: Arc::new(Mutex::new(BackendState::default())),
        }
    }

    /// Take every event queued for `identity`'s backend
    pub fn take_events(&self, identity: &str) -> Vec<LinkEvent> {
        lock(&self.state)
            .queues
            .get_mut(identity)
            .map(|q| q.drain(..).collect())
            .unwrap_or_default()
    }

    /// Datagrams sent by `identity` so far
    pub fn datagrams_from(&self, identity: &str) -> usize {
        lock(&self.state)
            .datagrams_from
            .get(identity)
            .copied()
            .unwrap_or(0)
    }

    fn push(&self, identity: &str, event: LinkEvent) {
        lock(&self.state)
            .queues
            .entry(identity.to_string())
            .or_default()
            .push_back(event);
    }
}

#[derive(Default)]
struct BackendState {
    sessions: usize,
    offers: Vec<(String, bool)>,
    answers: Vec<String>,
    remote_answers: Vec<String>,
    candidates: Vec<(String, String)>,
    closed: Vec<String>,
    sent: HashMap<String, usize>,
    failing_candidates: Vec<String>,
}

/// Link backend that connects instantly and records every call
#[derive(Clone)]
pub struct FakeBackend {
    local: String,
    network: FakeLinkNetwork,
    state: Arc<Mutex<BackendState>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        FakeLinkNetwork::new().backend("local")
    }

    /// `(remote, ice_restart)` for every offer created
    pub fn offers_created(&self) -> Vec<(String, bool)> {
        lock(&self.state).offers.clone()
    }

    pub fn answers_created(&self) -> Vec<String> {
        lock(&self.state).answers.clone()
    }

    pub fn remote_answers(&self) -> Vec<String> {
        lock(&self.state).remote_answers.clone()
    }

    /// `(remote, candidate)` for every remote candidate applied
    pub fn candidates_added(&self) -> Vec<(String, String)> {
        lock(&self.state).candidates.clone()
    }

    pub fn closed(&self) -> Vec<String> {
        lock(&self.state).closed.clone()
    }

    pub fn sent_to(&self, remote: &str) -> usize {
        lock(&self.state).sent.get(remote).copied().unwrap_or(0)
    }

    /// Make candidates from `remote` fail to apply
    pub fn fail_candidates_for(&self, remote: &str) {
        lock(&self.state).failing_candidates.push(remote.to_string());
    }

    fn next_session(&self) -> usize {
        let mut state = lock(&self.state);
        state.sessions += 1;
        state.sessions
    }

    fn advertise(&self, remote: &str, session: usize) {
        self.network.push(
            &self.local,
            LinkEvent::LocalCandidate {
                remote: remote.to_string(),
                candidate: IceCandidate::new(format!("candidate:{} {session}", self.local)),
            },
        );
    }
}

impl LinkBackend for FakeBackend {
    fn create_offer(
        &mut self,
        remote: &str,
        ice_restart: bool,
    ) -> std::result::Result<SessionDescription, String> {
        let session = self.next_session();
        lock(&self.state)
            .offers
            .push((remote.to_string(), ice_restart));
        self.advertise(remote, session);
        Ok(SessionDescription::offer(format!("{}-offer-{session}", self.local)))
    }

    fn create_answer(
        &mut self,
        remote: &str,
        _offer: &SessionDescription,
    ) -> std::result::Result<SessionDescription, String> {
        let session = self.next_session();
        lock(&self.state).answers.push(remote.to_string());
        self.advertise(remote, session);
        self.network.push(
            &self.local,
            LinkEvent::Connected {
                remote: remote.to_string(),
            },
        );
        Ok(SessionDescription::answer(format!("{}-answer-{session}", self.local)))
    }

    fn set_remote_answer(
        &mut self,
        remote: &str,
        _answer: &SessionDescription,
    ) -> std::result::Result<(), String> {
        lock(&self.state).remote_answers.push(remote.to_string());
        self.network.push(
            &self.local,
            LinkEvent::Connected {
                remote: remote.to_string(),
            },
        );
        Ok(())
    }

    fn add_remote_candidate(
        &mut self,
        remote: &str,
        candidate: &IceCandidate,
    ) -> std::result::Result<(), String> {
        let mut state = lock(&self.state);
        if state.failing_candidates.iter().any(|r| r == remote) {
            return Err(format!("candidate from {remote} unreachable"));
        }
        state
            .candidates
            .push((remote.to_string(), candidate.candidate.clone()));
        Ok(())
    }

    fn send(&mut self, remote: &str, datagram: &[u8]) -> std::result::Result<(), String> {
        *lock(&self.state).sent.entry(remote.to_string()).or_default() += 1;
        *lock(&self.network.state)
            .datagrams_from
            .entry(self.local.clone())
            .or_default() += 1;
        self.network.push(
            remote,
            LinkEvent::Datagram {
                remote: self.local.clone(),
                bytes: datagram.to_vec(),
            },
        );
        Ok(())
    }

    fn close(&mut self, remote: &str) {
        lock(&self.state).closed.push(remote.to_string());
    }
}

/// Orchestrator with links to `connected` (Connected) and `pending`
/// (AnswerExchanged) remotes
pub fn connected_orchestrator(
    local: &str,
    connected: &[&str],
    pending: &[&str],
) -> (Orchestrator, FakeBackend) {
    let backend = FakeLinkNetwork::new().backend(local);
    let mut orchestrator =
        Orchestrator::new(local, Box::new(backend.clone()), Duration::from_secs(10));
    let now = Instant::now();

    for remote in connected.iter().chain(pending) {
        orchestrator.add_member(remote, now);
        // Complete whichever half of the handshake the remote owes us
        let reply = if orchestrator.state(remote) == Some(SignalingState::OfferSent) {
            ChannelMessage::Answer(AnswerMessage {
                answer: SessionDescription::answer(format!("{remote}-answer")),
                from_identity: remote.to_string(),
                to_identity: local.to_string(),
            })
        } else {
            ChannelMessage::Offer(OfferMessage {
                offer: SessionDescription::offer(format!("{remote}-offer")),
                from_identity: remote.to_string(),
                to_identity: local.to_string(),
            })
        };
        orchestrator
            .handle_message(&reply, now)
            .expect("handshake accepted");
    }
    for remote in connected {
        orchestrator.on_backend_event(
            &LinkEvent::Connected {
                remote: remote.to_string(),
            },
            now,
        );
    }
    orchestrator.drain_outbox();
    orchestrator.drain_notices();
    (orchestrator, backend)
}

// =============================================================================
// Messaging Channel
// =============================================================================

/// Channel that records what was sent
pub struct RecordingChannel {
    connected: bool,
    sent: Vec<ChannelMessage>,
}

impl RecordingChannel {
    pub fn connected() -> Self {
        Self {
            connected: true,
            sent: Vec::new(),
        }
    }

    pub fn disconnected() -> Self {
        Self {
            connected: false,
            sent: Vec::new(),
        }
    }

    pub fn set_connected(&mut self, connected: bool) {
        self.connected = connected;
    }

    pub fn sent(&self) -> &[ChannelMessage] {
        &self.sent
    }

    /// Sequence numbers of relayed frames, in send order
    pub fn sent_frames(&self) -> Vec<u32> {
        self.sent
            .iter()
            .filter_map(|m| match m {
                ChannelMessage::AudioFrame(f) => Some(f.sequence),
                _ => None,
            })
            .collect()
    }
}

impl MessagingChannel for RecordingChannel {
    fn send(&mut self, message: ChannelMessage) -> std::result::Result<(), TransportError> {
        if !self.connected {
            return Err(TransportError::Disconnected);
        }
        self.sent.push(message);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

// =============================================================================
// Test Room
// =============================================================================

/// Rounds `pump` may run before it gives up on a message loop
const MAX_PUMP_ROUNDS: usize = 1000;

struct Peer {
    identity: String,
    engine: VoiceEngine,
    devices: FakeDevices,
    channel_rx: mpsc::UnboundedReceiver<ChannelEvent>,
    events_rx: mpsc::UnboundedReceiver<VoiceEvent>,
}

/// Several engines in one room, stepped by hand
pub struct TestRoom {
    hub: LoopbackHub,
    network: FakeLinkNetwork,
    peers: Vec<Peer>,
    now: Instant,
}

impl TestRoom {
    /// Room with `(identity, team)` members, all joined and linked
    pub fn new(strategy: TransportStrategy, members: &[(&str, &str)]) -> Self {
        Self::with_settings(strategy, members, |_| {})
    }

    pub fn with_settings(
        strategy: TransportStrategy,
        members: &[(&str, &str)],
        mut customize: impl FnMut(&mut VoiceSettings),
    ) -> Self {
        let hub = LoopbackHub::new();
        let network = FakeLinkNetwork::new();
        let mut peers = Vec::new();

        for (identity, _) in members {
            let mut settings = VoiceSettings {
                transport: strategy,
                codec: CodecKind::Pcm16,
                noise_suppression: false,
                agc: false,
                ..Default::default()
            };
            customize(&mut settings);

            let devices = FakeDevices::new();
            let (channel, channel_rx) = hub.connect(*identity);
            let (events_tx, events_rx) = mpsc::unbounded_channel();
            let backend: Option<Box<dyn LinkBackend>> = strategy
                .uses_links()
                .then(|| Box::new(network.backend(identity)) as Box<dyn LinkBackend>);
            let engine = VoiceEngine::new(
                *identity,
                settings,
                Box::new(channel),
                Box::new(devices.provider()),
                backend,
                events_tx,
            )
            .expect("engine");
            peers.push(Peer {
                identity: identity.to_string(),
                engine,
                devices,
                channel_rx,
                events_rx,
            });
        }

        let mut room = Self {
            hub,
            network,
            peers,
            now: Instant::now(),
        };
        room.hub
            .broadcast(ChannelMessage::RoomUpdate(RoomSnapshot {
                participants: members
                    .iter()
                    .map(|(identity, team)| RosterEntry {
                        identity: identity.to_string(),
                        team: Some(TeamId::new(*team)),
                    })
                    .collect(),
            }));
        room.pump();
        room
    }

    fn peer(&self, identity: &str) -> &Peer {
        self.peers
            .iter()
            .find(|p| p.identity == identity)
            .unwrap_or_else(|| panic!("no peer {identity}"))
    }

    fn peer_mut(&mut self, identity: &str) -> &mut Peer {
        self.peers
            .iter_mut()
            .find(|p| p.identity == identity)
            .unwrap_or_else(|| panic!("no peer {identity}"))
    }

    pub fn engine(&mut self, identity: &str) -> &mut VoiceEngine {
        &mut self.peer_mut(identity).engine
    }

    pub fn engine_ref(&self, identity: &str) -> &VoiceEngine {
        &self.peer(identity).engine
    }

    pub fn devices(&self, identity: &str) -> FakeDevices {
        self.peer(identity).devices.clone()
    }

    pub fn events(&mut self, identity: &str) -> &mut mpsc::UnboundedReceiver<VoiceEvent> {
        &mut self.peer_mut(identity).events_rx
    }

    pub fn hub(&self) -> &LoopbackHub {
        &self.hub
    }

    pub fn network(&self) -> &FakeLinkNetwork {
        &self.network
    }

    pub fn now(&self) -> Instant {
        self.now
    }

    pub fn advance(&mut self, by: Duration) {
        self.now += by;
    }

    /// Deliver channel and link events until every queue is empty
    pub fn pump(&mut self) {
        for _ in 0..MAX_PUMP_ROUNDS {
            let mut progressed = false;
            for peer in &mut self.peers {
                while let Ok(event) = peer.channel_rx.try_recv() {
                    peer.engine.on_channel_event(event, self.now);
                    progressed = true;
                }
                for event in self.network.take_events(&peer.identity) {
                    peer.engine.on_link_event(event, self.now);
                    progressed = true;
                }
            }
            if !progressed {
                return;
            }
        }
        panic!("room did not settle after {MAX_PUMP_ROUNDS} rounds");
    }

    /// Advance one frame interval, tick every engine, then pump
    pub fn tick(&mut self) {
        self.now += Duration::from_millis(u64::from(VOICE_FRAME_DURATION_MS));
        for peer in &mut self.peers {
            peer.engine.tick(self.now);
        }
        self.pump();
    }

    /// Announce a turn to everyone
    pub fn set_turn(&mut self, turn: TurnContext) {
        self.hub.broadcast(ChannelMessage::TurnUpdate(turn));
        self.pump();
    }

    /// Remove a member from the room
    pub fn leave(&mut self, identity: &str) {
        self.hub.disconnect(identity);
        self.hub
            .broadcast(ChannelMessage::Membership(MembershipUpdate {
                identity: identity.to_string(),
                change: MembershipChange::Left,
                team: None,
            }));
        self.pump();
    }

    /// Request and complete a start for `identity`
    pub fn start(&mut self, identity: &str) -> Result<bool> {
        let now = self.now;
        let engine = self.engine(identity);
        let started = match engine.request_start(now)? {
            StartOutcome::Pending(token) => engine.complete_start(token),
            StartOutcome::AlreadyActive => Ok(true),
            StartOutcome::InFlight => Ok(false),
        };
        self.pump();
        started
    }

    /// Feed one frame of constant samples to `identity`'s microphone and
    /// run a frame interval
    pub fn speak(&mut self, identity: &str, value: f32) {
        self.peer(identity)
            .devices
            .push_capture(vec![value; VOICE_SAMPLES_PER_FRAME as usize]);
        self.tick();
    }
}

/// Everything currently queued on an event receiver
pub fn drain_events(rx: &mut mpsc::UnboundedReceiver<VoiceEvent>) -> Vec<VoiceEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
