//! Voice session thread
//!
//! Runs a `VoiceEngine` on a dedicated OS thread with its own current-thread
//! tokio runtime. Audio streams are not `Send`, so the engine is built and
//! driven entirely on that thread; the UI talks to it through commands and
//! receives `VoiceEvent`s.

use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use tabu_common::voice::VOICE_FRAME_DURATION_MS;

use crate::channel::ChannelEvent;
use crate::error::Result;
use crate::lifecycle::{StartOutcome, StartToken, VoiceEngine, VoiceEvent};
use crate::signaling::LinkEvent;

/// Cadence of capture, playback flushes and link timers
const TICK_INTERVAL: Duration = Duration::from_millis(VOICE_FRAME_DURATION_MS as u64);

// =============================================================================
// Commands
// =============================================================================

/// Commands to control the voice session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceCommand {
    /// Start transmitting (only honored for the current speaker)
    Start,
    /// Stop transmitting and release all resources
    Stop,
    /// Release everything and end the session thread
    Shutdown,
}

/// Everything the session thread drives
pub struct EngineSetup {
    pub engine: VoiceEngine,
    pub channel_events: mpsc::UnboundedReceiver<ChannelEvent>,
    /// Link backend events (direct strategy only)
    pub link_events: Option<mpsc::UnboundedReceiver<LinkEvent>>,
}

// =============================================================================
// Session Runner
// =============================================================================

async fn next_link_event(rx: &mut Option<mpsc::UnboundedReceiver<LinkEvent>>) -> Option<LinkEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Drive an engine until shutdown or until its channel goes away
///
/// Starts are split: the `Start` command only issues a token, and device
/// acquisition happens on a later loop turn so that a teardown or turn
/// change arriving in between abandons it.
async fn run_session(
    setup: EngineSetup,
    events: mpsc::UnboundedSender<VoiceEvent>,
    mut command_rx: mpsc::UnboundedReceiver<VoiceCommand>,
) {
    let EngineSetup {
        mut engine,
        mut channel_events,
        mut link_events,
    } = setup;
    let (start_tx, mut start_rx) = mpsc::unbounded_channel::<StartToken>();

    let mut ticker = tokio::time::interval(TICK_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                engine.tick(Instant::now());
            }

            cmd = command_rx.recv() => {
                match cmd {
                    Some(VoiceCommand::Start) => match engine.request_start(Instant::now()) {
                        Ok(StartOutcome::Pending(token)) => {
                            let _ = start_tx.send(token);
                        }
                        Ok(outcome) => tracing::debug!(?outcome, "start ignored"),
                        Err(e) => {
                            tracing::info!(error = %e, "start refused");
                            let _ = events.send(VoiceEvent::Error(e.to_string()));
                        }
                    },
                    Some(VoiceCommand::Stop) => engine.request_stop(),
                    Some(VoiceCommand::Shutdown) | None => break,
                }
            }

            Some(token) = start_rx.recv() => {
                // Errors are reported as events by the engine
                let _ = engine.complete_start(token);
            }

            event = channel_events.recv() => {
                match event {
                    Some(event) => engine.on_channel_event(event, Instant::now()),
                    None => {
                        tracing::warn!("messaging channel closed");
                        engine.on_channel_event(ChannelEvent::ConnectionLost, Instant::now());
                        break;
                    }
                }
            }

            event = next_link_event(&mut link_events) => {
                match event {
                    Some(event) => engine.on_link_event(event, Instant::now()),
                    None => link_events = None,
                }
            }
        }
    }

    engine.shutdown();
    tracing::info!("voice session ended");
}

// =============================================================================
// Session Handle
// =============================================================================

/// Handle for controlling a running voice session
pub struct VoiceSessionHandle {
    command_tx: mpsc::UnboundedSender<VoiceCommand>,
    /// Using std::thread instead of tokio::spawn because audio streams are not Send
    handle: Option<JoinHandle<()>>,
}

impl VoiceSessionHandle {
    /// Start a voice session thread
    ///
    /// `build` runs on the session thread inside its runtime, so it may
    /// open sockets and spawn tasks. If it fails, the error is sent as a
    /// `VoiceEvent::Error` and the thread exits.
    ///
    /// # Returns
    /// The handle and the receiver for session events.
    pub fn start<F>(build: F) -> (Self, mpsc::UnboundedReceiver<VoiceEvent>)
    where
        F: FnOnce(mpsc::UnboundedSender<VoiceEvent>) -> Result<EngineSetup> + Send + 'static,
    {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let handle = std::thread::spawn(move || {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("Failed to create tokio runtime for voice thread");

            rt.block_on(async move {
                match build(event_tx.clone()) {
                    Ok(setup) => run_session(setup, event_tx, command_rx).await,
                    Err(e) => {
                        tracing::error!(error = %e, "failed to build voice engine");
                        let _ = event_tx.send(VoiceEvent::Error(e.to_string()));
                    }
                }
            });
        });

        (
            Self {
                command_tx,
                handle: Some(handle),
            },
            event_rx,
        )
    }

    /// Ask to start transmitting
    pub fn start_transmitting(&self) {
        let _ = self.command_tx.send(VoiceCommand::Start);
    }

    /// Stop transmitting and release devices and links
    pub fn stop_transmitting(&self) {
        let _ = self.command_tx.send(VoiceCommand::Stop);
    }

    /// End the session
    ///
    /// Does not wait for the thread so an unresponsive audio driver cannot
    /// block the caller.
    pub fn stop(&mut self) {
        let _ = self.command_tx.send(VoiceCommand::Shutdown);
        self.handle.take();
    }

    /// End the session and wait for the thread to release everything
    pub fn join(mut self) {
        let _ = self.command_tx.send(VoiceCommand::Shutdown);
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            tracing::error!("voice thread panicked");
        }
    }
}

impl Drop for VoiceSessionHandle {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.stop();
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
