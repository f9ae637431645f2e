//! Relay strategy: frames over the messaging channel

use std::collections::VecDeque;

use tabu_common::protocol::{ChannelMessage, RelayedFrame};
use tabu_common::voice::AudioFrame;

use crate::channel::MessagingChannel;
use crate::error::TransportError;
use crate::transport::{Outbound, Transport, TransportStrategy};

/// Sends each frame once as an `audioFrame` message
///
/// While the channel is down, the newest `backlog_frames` frames are held
/// and delivered on reconnect.
pub struct RelayTransport {
    backlog: VecDeque<AudioFrame>,
    backlog_frames: usize,
    dropped: u64,
}

impl RelayTransport {
    pub fn new(backlog_frames: usize) -> Self {
        Self {
            backlog: VecDeque::with_capacity(backlog_frames),
            backlog_frames,
            dropped: 0,
        }
    }

    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    /// Frames discarded from a full backlog
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    fn hold(&mut self, frame: AudioFrame) {
        if self.backlog_frames == 0 {
            self.dropped += 1;
            return;
        }
        while self.backlog.len() >= self.backlog_frames {
            self.backlog.pop_front();
            self.dropped += 1;
        }
        self.backlog.push_back(frame);
    }

    fn flush(&mut self, channel: &mut dyn MessagingChannel) -> usize {
        let mut sent = 0;
        while let Some(frame) = self.backlog.pop_front() {
            let message = ChannelMessage::AudioFrame(RelayedFrame::from_frame(&frame));
            if channel.send(message).is_err() {
                self.backlog.push_front(frame);
                break;
            }
            sent += 1;
        }
        sent
    }
}

impl Transport for RelayTransport {
    fn strategy(&self) -> TransportStrategy {
        TransportStrategy::Relay
    }

    fn send(
        &mut self,
        frame: &AudioFrame,
        recipients: &[String],
        out: &mut Outbound<'_>,
    ) -> Result<usize, TransportError> {
        if recipients.is_empty() {
            return Ok(0);
        }

        if !out.channel.is_connected() {
            self.hold(frame.clone());
            return Err(TransportError::Disconnected);
        }

        let mut sent = self.flush(out.channel);
        let message = ChannelMessage::AudioFrame(RelayedFrame::from_frame(frame));
        match out.channel.send(message) {
            Ok(()) => {
                sent += 1;
                Ok(sent)
            }
            Err(TransportError::Disconnected) => {
                self.hold(frame.clone());
                Err(TransportError::Disconnected)
            }
            Err(e) => Err(e),
        }
    }

    fn on_channel_connected(&mut self, channel: &mut dyn MessagingChannel) -> usize {
        let sent = self.flush(channel);
        if sent > 0 {
            tracing::debug!(frames = sent, "delivered held frames");
        }
        sent
    }

    fn reset(&mut self) {
        self.backlog.clear();
    }
}

/// Turn a relayed message back into a frame
pub fn decode_relayed(relayed: RelayedFrame) -> Result<AudioFrame, TransportError> {
    let sender = relayed.sender_identity.clone();
    relayed
        .into_frame()
        .ok_or_else(|| TransportError::Malformed(format!("undecodable payload from {sender}")))
}
