//! Audio frame format for voice relay
//!
//! This module defines the audio format constants, the immutable `AudioFrame`
//! produced by the capture side, and the binary packet used to carry frames
//! over direct peer links. Frames are produced at ~16 frames/second
//! (60ms cadence) with Opus or raw 16-bit PCM payloads.

use serde::{Deserialize, Serialize};

/// Sample rate for voice audio (48kHz, required by Opus and the audio processor)
pub const VOICE_SAMPLE_RATE: u32 = 48000;

/// Frame duration in milliseconds (capture cadence)
pub const VOICE_FRAME_DURATION_MS: u32 = 60;

/// Number of samples per frame at 48kHz with 60ms frames
pub const VOICE_SAMPLES_PER_FRAME: u32 = VOICE_SAMPLE_RATE * VOICE_FRAME_DURATION_MS / 1000;

/// Number of audio channels (mono)
pub const VOICE_CHANNELS: u16 = 1;

/// Maximum payload size for a single frame
///
/// A raw PCM frame is 2880 samples * 2 bytes = 5760 bytes. Opus frames are
/// an order of magnitude smaller. Anything larger is rejected as malformed.
pub const MAX_FRAME_PAYLOAD: usize = 8192;

/// Maximum sender identity length in bytes (UTF-8)
pub const MAX_IDENTITY_LEN: usize = 64;

/// Fixed part of a frame packet header (without the sender identity)
/// - Type: 1 byte
/// - Codec: 1 byte
/// - Channels: 1 byte
/// - Sample rate: 4 bytes
/// - Sender length: 1 byte
/// - Sequence: 4 bytes
/// - Timestamp: 4 bytes
pub const FRAME_HEADER_FIXED_SIZE: usize = 1 + 1 + 1 + 4 + 1 + 4 + 4;

/// Voice quality presets (Opus bitrate in bits per second)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum VoiceQuality {
    /// Low quality: 16 kbps - minimal bandwidth usage
    Low = 16000,
    /// Medium quality: 32 kbps - good balance
    #[default]
    Medium = 32000,
    /// High quality: 64 kbps
    High = 64000,
}

impl VoiceQuality {
    /// Get the bitrate in bits per second
    pub fn bitrate(self) -> i32 {
        self as i32
    }

    /// Get all quality levels
    pub fn all() -> &'static [VoiceQuality] {
        &[VoiceQuality::Low, VoiceQuality::Medium, VoiceQuality::High]
    }
}

/// Payload encoding of an audio frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CodecKind {
    /// Raw 16-bit signed little-endian PCM
    Pcm16,
    /// Opus compressed
    #[default]
    Opus,
}

impl CodecKind {
    /// Convert from byte value
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(CodecKind::Pcm16),
            0x02 => Some(CodecKind::Opus),
            _ => None,
        }
    }

    /// Convert to byte value
    pub fn to_byte(self) -> u8 {
        match self {
            CodecKind::Pcm16 => 0x01,
            CodecKind::Opus => 0x02,
        }
    }
}

impl std::fmt::Display for CodecKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodecKind::Pcm16 => write!(f, "pcm16"),
            CodecKind::Opus => write!(f, "opus"),
        }
    }
}

/// Format of an audio frame payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioFormat {
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Channel count
    pub channels: u16,
    /// Payload codec
    pub codec: CodecKind,
}

impl AudioFormat {
    /// Voice format (48kHz mono) with the given codec
    pub fn voice(codec: CodecKind) -> Self {
        Self {
            sample_rate: VOICE_SAMPLE_RATE,
            channels: VOICE_CHANNELS,
            codec,
        }
    }
}

/// One encoded frame of voice audio
///
/// Immutable once constructed. Produced by the capture side, consumed once
/// by each recipient's playback chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    sender_identity: String,
    sequence: u32,
    timestamp: u32,
    payload: Vec<u8>,
    format: AudioFormat,
}

impl AudioFrame {
    /// Construct a frame
    pub fn new(
        sender_identity: impl Into<String>,
        sequence: u32,
        timestamp: u32,
        payload: Vec<u8>,
        format: AudioFormat,
    ) -> Self {
        Self {
            sender_identity: sender_identity.into(),
            sequence,
            timestamp,
            payload,
            format,
        }
    }

    /// Identity of the participant that captured the frame
    pub fn sender_identity(&self) -> &str {
        &self.sender_identity
    }

    /// Per-session sequence number (wraps)
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    /// Timestamp in samples at the frame's sample rate (wraps)
    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    /// Encoded payload
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Payload format
    pub fn format(&self) -> AudioFormat {
        self.format
    }
}

/// Message types for direct link datagrams
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameMessageType {
    /// Voice audio data
    VoiceData = 0x01,
    /// Keepalive (no payload)
    Keepalive = 0x02,
}

impl FrameMessageType {
    /// Convert from byte value
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(FrameMessageType::VoiceData),
            0x02 => Some(FrameMessageType::Keepalive),
            _ => None,
        }
    }

    /// Convert to byte value
    pub fn to_byte(self) -> u8 {
        self as u8
    }
}

/// Datagram sent over a direct link
///
/// Wire format (binary, big-endian):
/// ```text
/// +----------------+----------------+----------------+
/// |    type (1)    |   codec (1)    |  channels (1)  |
/// +----------------+----------------+----------------+
/// |               sample rate (4)                    |
/// +----------------+----------------+----------------+
/// | sender_len (1) |         sender (var)            |
/// +----------------+----------------+----------------+
/// |  sequence (4)  | timestamp (4)  |  payload (var) |
/// +----------------+----------------+----------------+
/// ```
#[derive(Debug, Clone)]
pub struct FramePacket {
    /// Message type
    pub msg_type: FrameMessageType,
    /// Carried frame (keepalives carry an empty payload)
    pub frame: AudioFrame,
}

impl FramePacket {
    /// Wrap a voice frame
    pub fn voice(frame: AudioFrame) -> Self {
        Self {
            msg_type: FrameMessageType::VoiceData,
            frame,
        }
    }

    /// Create a keepalive packet for a sender
    pub fn keepalive(sender: &str, codec: CodecKind) -> Self {
        Self {
            msg_type: FrameMessageType::Keepalive,
            frame: AudioFrame::new(sender, 0, 0, Vec::new(), AudioFormat::voice(codec)),
        }
    }

    /// Check if this is a keepalive packet
    pub fn is_keepalive(&self) -> bool {
        self.msg_type == FrameMessageType::Keepalive
    }

    /// Serialize the packet to bytes for transmission
    pub fn to_bytes(&self) -> Vec<u8> {
        let frame = &self.frame;
        let sender_bytes = frame.sender_identity.as_bytes();
        let sender_len = sender_bytes.len().min(MAX_IDENTITY_LEN);

        let mut bytes =
            Vec::with_capacity(FRAME_HEADER_FIXED_SIZE + sender_len + frame.payload.len());

        bytes.push(self.msg_type.to_byte());
        bytes.push(frame.format.codec.to_byte());
        bytes.push(frame.format.channels.min(u8::MAX as u16) as u8);
        bytes.extend_from_slice(&frame.format.sample_rate.to_be_bytes());
        bytes.push(sender_len as u8);
        bytes.extend_from_slice(&sender_bytes[..sender_len]);
        bytes.extend_from_slice(&frame.sequence.to_be_bytes());
        bytes.extend_from_slice(&frame.timestamp.to_be_bytes());
        bytes.extend_from_slice(&frame.payload);

        bytes
    }

    /// Deserialize a packet from bytes
    ///
    /// Returns `None` if the packet is malformed, truncated or oversized.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < FRAME_HEADER_FIXED_SIZE {
            return None;
        }

        let msg_type = FrameMessageType::from_byte(bytes[0])?;
        let codec = CodecKind::from_byte(bytes[1])?;
        let channels = bytes[2] as u16;
        let sample_rate = u32::from_be_bytes([bytes[3], bytes[4], bytes[5], bytes[6]]);

        let sender_len = bytes[7] as usize;
        if sender_len > MAX_IDENTITY_LEN {
            return None;
        }

        let min_len = FRAME_HEADER_FIXED_SIZE + sender_len;
        if bytes.len() < min_len || bytes.len() - min_len > MAX_FRAME_PAYLOAD {
            return None;
        }

        let sender = std::str::from_utf8(&bytes[8..8 + sender_len])
            .ok()?
            .to_string();

        let offset = 8 + sender_len;
        let sequence = u32::from_be_bytes([
            bytes[offset],
            bytes[offset + 1],
            bytes[offset + 2],
            bytes[offset + 3],
        ]);
        let timestamp = u32::from_be_bytes([
            bytes[offset + 4],
            bytes[offset + 5],
            bytes[offset + 6],
            bytes[offset + 7],
        ]);
        let payload = bytes[offset + 8..].to_vec();

        Some(Self {
            msg_type,
            frame: AudioFrame::new(
                sender,
                sequence,
                timestamp,
                payload,
                AudioFormat {
                    sample_rate,
                    channels,
                    codec,
                },
            ),
        })
    }
}
