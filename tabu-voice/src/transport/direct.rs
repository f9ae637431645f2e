//! Direct strategy: frames over per-remote links

use tabu_common::voice::{AudioFrame, FramePacket};

use crate::channel::MessagingChannel;
use crate::error::TransportError;
use crate::transport::{Outbound, Transport, TransportStrategy};

/// Sends a `FramePacket` to each recipient over its connected link
#[derive(Default)]
pub struct DirectTransport {
    skipped: u64,
}

impl DirectTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recipients skipped because their link was not connected
    pub fn skipped(&self) -> u64 {
        self.skipped
    }
}

impl Transport for DirectTransport {
    fn strategy(&self) -> TransportStrategy {
        TransportStrategy::Direct
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
        let Some(links) = out.links.as_deref_mut() else {
            return Err(TransportError::Send("no links available".to_string()));
        };

        let datagram = FramePacket::voice(frame.clone()).to_bytes();
        let mut sent = 0;
        for recipient in recipients {
            match links.send_datagram(recipient, &datagram) {
                Ok(()) => sent += 1,
                Err(e) => {
                    self.skipped += 1;
                    tracing::trace!(recipient = %recipient, error = %e, "frame not delivered");
                }
            }
        }
        Ok(sent)
    }

    fn on_channel_connected(&mut self, _channel: &mut dyn MessagingChannel) -> usize {
        0
    }

    fn reset(&mut self) {}
}

/// Turn a link datagram back into a frame
///
/// # Returns
/// `Ok(None)` for keepalives. A frame claiming a sender other than the
/// link's remote is rejected.
pub fn decode_datagram(remote: &str, bytes: &[u8]) -> Result<Option<AudioFrame>, TransportError> {
    let packet = FramePacket::from_bytes(bytes)
        .ok_or_else(|| TransportError::Malformed(format!("bad datagram from {remote}")))?;
    if packet.is_keepalive() {
        return Ok(None);
    }
    if packet.frame.sender_identity() != remote {
        return Err(TransportError::Malformed(format!(
            "datagram from {remote} claims sender {}",
            packet.frame.sender_identity()
        )));
    }
    Ok(Some(packet.frame))
}
