//! WebSocket messaging channel
//!
//! Connects to the room server, joins the room after every (re)connect and
//! exchanges `{"event", "data"}` JSON text frames. A dropped connection is
//! retried with exponential backoff; after `max_reconnect_attempts`
//! consecutive failures the channel reports `ConnectionLost` and stops.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::sink::Sink;
use futures_util::stream::Stream;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::tungstenite::protocol::Message;

use tabu_common::protocol::{ChannelMessage, RoomJoin};

use crate::channel::{ChannelEvent, MessagingChannel};
use crate::error::TransportError;

// =============================================================================
// Constants
// =============================================================================

/// Maximum size of an inbound text message (256 KB)
const MAX_WS_MESSAGE_SIZE: usize = 256 * 1024;

/// Default consecutive reconnect attempts before giving up
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 8;

/// First reconnect delay
const INITIAL_BACKOFF_MS: u64 = 500;

/// Longest reconnect delay
const MAX_BACKOFF_MS: u64 = 10_000;

// =============================================================================
// Configuration
// =============================================================================

/// Where and as whom to connect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebSocketConfig {
    pub url: String,
    pub room_id: String,
    pub identity: String,
    pub max_reconnect_attempts: u32,
}

impl WebSocketConfig {
    pub fn new(
        url: impl Into<String>,
        room_id: impl Into<String>,
        identity: impl Into<String>,
    ) -> Self {
        Self {
            url: url.into(),
            room_id: room_id.into(),
            identity: identity.into(),
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
        }
    }

    fn room_join(&self) -> RoomJoin {
        RoomJoin {
            room_id: self.room_id.clone(),
            identity: self.identity.clone(),
        }
    }
}

/// Delay before reconnect attempt `attempt` (1-based)
fn backoff(attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    let delay = INITIAL_BACKOFF_MS.saturating_mul(1u64 << exponent);
    Duration::from_millis(delay.min(MAX_BACKOFF_MS))
}

// =============================================================================
// WebSocket Channel
// =============================================================================

/// Messaging channel backed by a reconnecting WebSocket client
pub struct WebSocketChannel {
    outbound: mpsc::UnboundedSender<ChannelMessage>,
    connected: Arc<AtomicBool>,
}

impl WebSocketChannel {
    /// Start the client task
    ///
    /// Must be called from within a tokio runtime. The task stops when the
    /// channel is dropped (sending `leaveRoom` if connected) or when it
    /// gives up reconnecting.
    ///
    /// # Returns
    /// The channel, its event stream and the client task, which can be
    /// awaited to let `leaveRoom` go out before exiting.
    pub fn spawn(
        config: WebSocketConfig,
    ) -> (Self, mpsc::UnboundedReceiver<ChannelEvent>, JoinHandle<()>) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(false));

        let task = tokio::spawn(run_channel(
            config,
            outbound_rx,
            event_tx,
            connected.clone(),
        ));

        (
            Self {
                outbound: outbound_tx,
                connected,
            },
            event_rx,
            task,
        )
    }
}

impl MessagingChannel for WebSocketChannel {
    fn send(&mut self, message: ChannelMessage) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Disconnected);
        }
        self.outbound
            .send(message)
            .map_err(|_| TransportError::Disconnected)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

// =============================================================================
// Client Task
// =============================================================================

/// How a connected session ended
#[derive(Debug, PartialEq, Eq)]
enum SessionEnd {
    /// The channel handle was dropped
    Shutdown,
    /// The server or network closed the connection
    Closed,
}

async fn run_channel(
    config: WebSocketConfig,
    mut outbound: mpsc::UnboundedReceiver<ChannelMessage>,
    events: mpsc::UnboundedSender<ChannelEvent>,
    connected: Arc<AtomicBool>,
) {
    let mut attempts = 0u32;

    loop {
        tracing::info!(url = %config.url, room = %config.room_id, "connecting to room server");
        match tokio_tungstenite::connect_async(config.url.as_str()).await {
            Ok((ws_stream, _response)) => {
                attempts = 0;
                connected.store(true, Ordering::SeqCst);
                if events.send(ChannelEvent::Connected).is_err() {
                    return;
                }

                let end = serve_session(ws_stream, &config, &mut outbound, &events).await;
                connected.store(false, Ordering::SeqCst);
                if end == SessionEnd::Shutdown {
                    return;
                }
                tracing::warn!(url = %config.url, "connection to room server dropped");
                if events.send(ChannelEvent::Disconnected).is_err() {
                    return;
                }
            }
            Err(e) => {
                tracing::warn!(url = %config.url, error = %e, "failed to connect to room server");
            }
        }

        attempts += 1;
        if attempts > config.max_reconnect_attempts {
            tracing::error!(attempts, "giving up on room server");
            let _ = events.send(ChannelEvent::ConnectionLost);
            return;
        }

        let delay = backoff(attempts);
        tracing::debug!(attempt = attempts, delay_ms = delay.as_millis() as u64, "reconnecting");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            message = outbound.recv() => {
                if message.is_none() {
                    return;
                }
                // Sends are refused while disconnected; nothing to deliver
            }
        }
    }
}

/// Run one connected session
///
/// Sends `joinRoom` first, then pumps outbound messages to the socket and
/// inbound text frames to `events` until either side closes.
async fn serve_session<S>(
    ws_stream: S,
    config: &WebSocketConfig,
    outbound: &mut mpsc::UnboundedReceiver<ChannelMessage>,
    events: &mpsc::UnboundedSender<ChannelEvent>,
) -> SessionEnd
where
    S: Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Unpin,
{
    let (mut sink, mut stream) = ws_stream.split();

    if send_message(&mut sink, &ChannelMessage::JoinRoom(config.room_join()))
        .await
        .is_err()
    {
        return SessionEnd::Closed;
    }

    loop {
        tokio::select! {
            message = outbound.recv() => {
                let Some(message) = message else {
                    let _ = send_message(&mut sink, &ChannelMessage::LeaveRoom(config.room_join())).await;
                    let _ = sink.close().await;
                    return SessionEnd::Shutdown;
                };
                if send_message(&mut sink, &message).await.is_err() {
                    return SessionEnd::Closed;
                }
            }

            frame = stream.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        if text.len() > MAX_WS_MESSAGE_SIZE {
                            tracing::warn!(len = text.len(), "dropping oversized message");
                            continue;
                        }
                        match ChannelMessage::from_json(text.as_str()) {
                            Ok(message) => {
                                if events.send(ChannelEvent::Message(message)).is_err() {
                                    return SessionEnd::Shutdown;
                                }
                            }
                            Err(e) => {
                                tracing::debug!(error = %e, "ignoring unrecognized message");
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return SessionEnd::Closed,
                    Some(Ok(Message::Binary(_) | Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
                    Some(Err(e)) => {
                        tracing::debug!(error = %e, "websocket receive failed");
                        return SessionEnd::Closed;
                    }
                }
            }
        }
    }
}

async fn send_message<S>(sink: &mut S, message: &ChannelMessage) -> Result<(), WsError>
where
    S: Sink<Message, Error = WsError> + Unpin,
{
    let json = match message.to_json() {
        Ok(json) => json,
        Err(e) => {
            tracing::warn!(event = message.event_name(), error = %e, "failed to serialize message");
            return Ok(());
        }
    };
    sink.send(Message::Text(json.into())).await
}

// =============================================================================
// Tests
// =============================================================================
