//! Tabu voice relay client
//!
//! Joins a room on the game server and relays voice for the current
//! speaker. Type `talk`, `stop` or `quit` on stdin.

mod args;

use std::net::IpAddr;
use std::time::Duration;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use tabu_voice::channel::{WebSocketChannel, WebSocketConfig};
use tabu_voice::config::VoiceSettings;
use tabu_voice::signaling::{DtlsBackend, LinkBackend};
use tabu_voice::voice::audio::{CpalDeviceProvider, list_input_devices, list_output_devices};
use tabu_voice::{EngineSetup, VoiceEngine, VoiceError, VoiceEvent, VoiceSessionHandle};

use args::Args;

/// Default log filter when `RUST_LOG` is not set
const DEFAULT_LOG_FILTER: &str = "tabu_voice=info";

/// How long to wait for `leaveRoom` to reach the server on exit
const LEAVE_TIMEOUT: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .init();

    if args.list_devices {
        print_devices();
        return;
    }

    let mut settings = VoiceSettings::load(args.config.clone());
    if let Some(strategy) = args.strategy {
        settings.transport = strategy;
    }
    if let Some(device) = args.input_device.clone() {
        settings.input_device = device;
    }
    if let Some(device) = args.output_device.clone() {
        settings.output_device = device;
    }
    if args.auto_transmit {
        settings.auto_transmit = true;
    }

    let identity = args
        .identity
        .clone()
        .unwrap_or_else(|| format!("player-{}", &Uuid::new_v4().simple().to_string()[..8]));
    tracing::info!(
        identity = %identity,
        room = %args.room,
        server = %args.server,
        transport = %settings.transport,
        "joining room"
    );

    let (channel, channel_events, channel_task) =
        WebSocketChannel::spawn(WebSocketConfig::new(&args.server, &args.room, &identity));

    let (handle, mut events) = VoiceSessionHandle::start(move |event_tx| {
        let (link_backend, link_events) = if settings.transport.uses_links() {
            let bind_ip: IpAddr = settings.link_bind_address.parse().map_err(|_| {
                VoiceError::Config(format!(
                    "invalid link bind address: {}",
                    settings.link_bind_address
                ))
            })?;
            let (link_tx, link_rx) = mpsc::unbounded_channel();
            let backend = DtlsBackend::new(identity.clone(), bind_ip, link_tx)
                .map_err(VoiceError::Config)?;
            (Some(Box::new(backend) as Box<dyn LinkBackend>), Some(link_rx))
        } else {
            (None, None)
        };

        let engine = VoiceEngine::new(
            identity,
            settings,
            Box::new(channel),
            Box::new(CpalDeviceProvider),
            link_backend,
            event_tx,
        )?;
        Ok(EngineSetup {
            engine,
            channel_events,
            link_events,
        })
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => match line.trim() {
                        "talk" | "t" => handle.start_transmitting(),
                        "stop" | "s" => handle.stop_transmitting(),
                        "quit" | "q" => break,
                        "" => {}
                        other => println!("unknown command: {other} (talk, stop, quit)"),
                    },
                    Ok(None) => break,
                    Err(e) => {
                        tracing::error!(error = %e, "failed to read stdin");
                        break;
                    }
                }
            }

            event = events.recv() => {
                match event {
                    Some(event) => print_event(&event),
                    None => break,
                }
            }

            _ = tokio::signal::ctrl_c() => break,
        }
    }

    // Teardown runs on the voice thread and drops the channel, which sends
    // leaveRoom from the client task
    if tokio::task::spawn_blocking(move || handle.join()).await.is_err() {
        tracing::error!("failed to wait for voice thread");
    }
    if tokio::time::timeout(LEAVE_TIMEOUT, channel_task).await.is_err() {
        tracing::warn!("timed out leaving the room");
    }
}

fn print_devices() {
    println!("Input devices:");
    for device in list_input_devices() {
        println!("  {device}");
    }
    println!("Output devices:");
    for device in list_output_devices() {
        println!("  {device}");
    }
}

fn print_event(event: &VoiceEvent) {
    match event {
        VoiceEvent::CaptureStarted { codec } => println!("transmitting ({codec})"),
        VoiceEvent::CaptureStopped { reason } => println!("stopped transmitting ({reason:?})"),
        VoiceEvent::SpeakerChanged { speaker: Some(speaker) } => println!("speaker: {speaker}"),
        VoiceEvent::SpeakerChanged { speaker: None } => println!("no speaker"),
        VoiceEvent::ChannelConnected => println!("connected"),
        VoiceEvent::ChannelDisconnected => println!("disconnected"),
        VoiceEvent::TornDown { reason } => println!("voice released ({reason})"),
        VoiceEvent::LinkFailed { remote, error } => println!("link to {remote} failed: {error}"),
        VoiceEvent::Error(message) => println!("error: {message}"),
        VoiceEvent::LinkStateChanged { remote, state } => {
            tracing::debug!(remote = %remote, ?state, "link state changed");
        }
    }
}
