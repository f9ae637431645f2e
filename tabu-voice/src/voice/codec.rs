//! Frame codec: raw sample buffers to transmissible payloads and back
//!
//! Two payload encodings are supported:
//! - `Pcm16`: 16-bit little-endian PCM, always available
//! - `Opus`: compressed, used when a local encoder and decoder can be created
//!
//! Uses f32 samples throughout for compatibility with WebRTC audio processing.

use opus::{Application, Channels, Decoder, Encoder};
use tabu_common::voice::{
    AudioFormat, CodecKind, VOICE_CHANNELS, VOICE_SAMPLE_RATE, VOICE_SAMPLES_PER_FRAME,
    VoiceQuality,
};

// =============================================================================
// Constants
// =============================================================================

/// Maximum encoded Opus frame size in bytes (three 20ms sub-frames of 1275 bytes)
const MAX_ENCODED_FRAME_SIZE: usize = 4000;

/// Largest decoded frame accepted (120ms, the Opus maximum)
const MAX_DECODED_SAMPLES: usize = VOICE_SAMPLES_PER_FRAME as usize * 2;

/// Scale for negative samples
const PCM_NEGATIVE_SCALE: f32 = 32768.0;

/// Scale for non-negative samples
const PCM_POSITIVE_SCALE: f32 = 32767.0;

// =============================================================================
// Raw PCM
// =============================================================================

/// Quantize samples to 16-bit little-endian PCM
///
/// Samples are clamped to [-1.0, 1.0] and scaled asymmetrically so both
/// ends of the range map exactly onto i16::MIN and i16::MAX.
pub fn pcm16_encode(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        let s = if sample.is_nan() {
            0.0
        } else {
            sample.clamp(-1.0, 1.0)
        };
        let scaled = if s < 0.0 {
            s * PCM_NEGATIVE_SCALE
        } else {
            s * PCM_POSITIVE_SCALE
        };
        let value = scaled.round() as i16;
        out.extend_from_slice(&value.to_le_bytes());
    }
    out
}

/// Decode 16-bit little-endian PCM to f32 samples
pub fn pcm16_decode(payload: &[u8]) -> Result<Vec<f32>, String> {
    if payload.len() % 2 != 0 {
        return Err(format!("PCM payload has odd length {}", payload.len()));
    }
    Ok(payload
        .chunks_exact(2)
        .map(|pair| {
            let value = i16::from_le_bytes([pair[0], pair[1]]);
            if value < 0 {
                value as f32 / PCM_NEGATIVE_SCALE
            } else {
                value as f32 / PCM_POSITIVE_SCALE
            }
        })
        .collect())
}

/// Raw peak amplitude of a buffer
pub fn peak_amplitude(samples: &[f32]) -> f32 {
    samples.iter().map(|s| s.abs()).fold(0.0f32, f32::max)
}

fn opus_channels() -> Channels {
    if VOICE_CHANNELS == 1 {
        Channels::Mono
    } else {
        Channels::Stereo
    }
}

// =============================================================================
// Voice Encoder
// =============================================================================

/// Opus encoder for outgoing voice audio
pub struct VoiceEncoder {
    /// The Opus encoder instance
    encoder: Encoder,
}

impl VoiceEncoder {
    /// Create a new voice encoder with the specified quality
    ///
    /// # Arguments
    /// * `quality` - Voice quality preset (affects bitrate)
    ///
    /// # Returns
    /// * `Ok(VoiceEncoder)` - Encoder ready for use
    /// * `Err(String)` - Error message if encoder couldn't be created
    pub fn new(quality: VoiceQuality) -> Result<Self, String> {
        let mut encoder = Encoder::new(VOICE_SAMPLE_RATE, opus_channels(), Application::Voip)
            .map_err(|e| format!("Failed to create Opus encoder: {}", e))?;

        encoder
            .set_bitrate(opus::Bitrate::Bits(quality.bitrate()))
            .map_err(|e| format!("Failed to set bitrate: {}", e))?;

        Ok(Self { encoder })
    }

    /// Encode one voice frame (VOICE_SAMPLES_PER_FRAME samples)
    pub fn encode(&mut self, samples: &[f32]) -> Result<Vec<u8>, String> {
        if samples.len() != VOICE_SAMPLES_PER_FRAME as usize {
            return Err(format!(
                "Expected {} samples, got {}",
                VOICE_SAMPLES_PER_FRAME,
                samples.len()
            ));
        }

        let mut output = vec![0u8; MAX_ENCODED_FRAME_SIZE];
        let len = self
            .encoder
            .encode_float(samples, &mut output)
            .map_err(|e| format!("Opus encode error: {}", e))?;

        output.truncate(len);
        Ok(output)
    }
}

// =============================================================================
// Voice Decoder
// =============================================================================

/// Opus decoder for incoming voice audio
pub struct VoiceDecoder {
    /// The Opus decoder instance
    decoder: Decoder,
}

impl VoiceDecoder {
    /// Create a new voice decoder
    pub fn new() -> Result<Self, String> {
        let decoder = Decoder::new(VOICE_SAMPLE_RATE, opus_channels())
            .map_err(|e| format!("Failed to create Opus decoder: {}", e))?;

        Ok(Self { decoder })
    }

    /// Decode an Opus frame to samples normalized to [-1.0, 1.0]
    pub fn decode(&mut self, data: &[u8]) -> Result<Vec<f32>, String> {
        let mut output = vec![0f32; MAX_DECODED_SAMPLES];

        let len = self
            .decoder
            .decode_float(data, &mut output, false)
            .map_err(|e| format!("Opus decode error: {}", e))?;

        output.truncate(len);
        Ok(output)
    }
}

// =============================================================================
// Frame Encoder / Decoder
// =============================================================================

/// Encoder for the negotiated payload codec
pub enum FrameEncoder {
    Pcm16,
    Opus(VoiceEncoder),
}

impl FrameEncoder {
    pub fn codec(&self) -> CodecKind {
        match self {
            FrameEncoder::Pcm16 => CodecKind::Pcm16,
            FrameEncoder::Opus(_) => CodecKind::Opus,
        }
    }

    pub fn format(&self) -> AudioFormat {
        AudioFormat::voice(self.codec())
    }

    /// Encode a frame of samples
    pub fn encode(&mut self, samples: &[f32]) -> Result<Vec<u8>, String> {
        match self {
            FrameEncoder::Pcm16 => Ok(pcm16_encode(samples)),
            FrameEncoder::Opus(encoder) => encoder.encode(samples),
        }
    }
}

/// Pick the payload codec for this client
///
/// Opus is used only if both a local encoder and decoder can be created.
/// Otherwise falls back to `Pcm16`.
pub fn negotiate_codec(preferred: CodecKind, quality: VoiceQuality) -> FrameEncoder {
    if preferred == CodecKind::Pcm16 {
        return FrameEncoder::Pcm16;
    }

    match (VoiceEncoder::new(quality), VoiceDecoder::new()) {
        (Ok(encoder), Ok(_)) => FrameEncoder::Opus(encoder),
        (Err(e), _) | (_, Err(e)) => {
            tracing::warn!(error = %e, "Opus unavailable, falling back to pcm16");
            FrameEncoder::Pcm16
        }
    }
}

/// Decoder for one remote sender
///
/// Keeps Opus state per sender for better concealment; the Opus decoder is
/// created on the first Opus frame.
#[derive(Default)]
pub struct FrameDecoder {
    opus: Option<VoiceDecoder>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode a payload in the given format
    ///
    /// Returns an error if the format is not 48kHz mono or the codec cannot
    /// be decoded locally.
    pub fn decode(&mut self, payload: &[u8], format: AudioFormat) -> Result<Vec<f32>, String> {
        if format.sample_rate != VOICE_SAMPLE_RATE || format.channels != VOICE_CHANNELS {
            return Err(format!(
                "Unsupported format {}Hz/{}ch",
                format.sample_rate, format.channels
            ));
        }

        match format.codec {
            CodecKind::Pcm16 => pcm16_decode(payload),
            CodecKind::Opus => {
                if self.opus.is_none() {
                    self.opus = Some(VoiceDecoder::new()?);
                }
                match self.opus.as_mut() {
                    Some(decoder) => decoder.decode(payload),
                    None => Err("Opus decoder unavailable".to_string()),
                }
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(amplitude: f32) -> Vec<f32> {
        (0..VOICE_SAMPLES_PER_FRAME)
            .map(|i| {
                let t = i as f32 / VOICE_SAMPLE_RATE as f32;
                f32::sin(2.0 * std::f32::consts::PI * 440.0 * t) * amplitude
            })
            .collect()
    }

    #[test]
    fn test_pcm16_round_trip_error_bound() {
        let mut samples = sine(0.9);
        samples.extend_from_slice(&[-1.0, 1.0, 0.0, 0.5, -0.5, 1.0 / 32768.0]);

        let decoded = pcm16_decode(&pcm16_encode(&samples)).unwrap();
        assert_eq!(decoded.len(), samples.len());
        for (a, b) in samples.iter().zip(&decoded) {
            assert!((a - b).abs() <= 1.0 / 32768.0, "{} vs {}", a, b);
        }
    }

    #[test]
    fn test_pcm16_extremes_and_clamping() {
        let bytes = pcm16_encode(&[-1.0, 1.0, -3.0, 7.5, f32::NAN]);
        let values: Vec<i16> = bytes
            .chunks_exact(2)
            .map(|p| i16::from_le_bytes([p[0], p[1]]))
            .collect();
        assert_eq!(values, vec![i16::MIN, i16::MAX, i16::MIN, i16::MAX, 0]);
    }

    #[test]
    fn test_pcm16_little_endian() {
        // 0.5 * 32767 = 16383.5, rounds to 16384 = 0x4000
        assert_eq!(pcm16_encode(&[0.5]), vec![0x00, 0x40]);
    }

    #[test]
    fn test_pcm16_odd_length_rejected() {
        assert!(pcm16_decode(&[0x00, 0x40, 0x01]).is_err());
    }

    #[test]
    fn test_peak_amplitude() {
        assert_eq!(peak_amplitude(&[]), 0.0);
        assert_eq!(peak_amplitude(&[0.1, -0.4, 0.3]), 0.4);
    }

    #[test]
    fn test_opus_round_trip() {
        let mut encoder = VoiceEncoder::new(VoiceQuality::High).unwrap();
        let mut decoder = FrameDecoder::new();

        let samples = sine(0.5);
        let encoded = encoder.encode(&samples).unwrap();
        assert!(!encoded.is_empty());
        assert!(encoded.len() < samples.len() * 2);

        let decoded = decoder
            .decode(&encoded, AudioFormat::voice(CodecKind::Opus))
            .unwrap();
        assert_eq!(decoded.len(), VOICE_SAMPLES_PER_FRAME as usize);

        // Lossy: just verify we got audio, not silence
        assert!(peak_amplitude(&decoded) > 0.1, "Decoded audio seems too quiet");
    }

    #[test]
    fn test_encoder_wrong_frame_size() {
        let mut encoder = VoiceEncoder::new(VoiceQuality::Medium).unwrap();
        assert!(encoder.encode(&[0.0f32; 100]).is_err());
    }

    #[test]
    fn test_negotiate_codec() {
        assert_eq!(
            negotiate_codec(CodecKind::Pcm16, VoiceQuality::Medium).codec(),
            CodecKind::Pcm16
        );
        assert_eq!(
            negotiate_codec(CodecKind::Opus, VoiceQuality::Medium).codec(),
            CodecKind::Opus
        );
    }

    #[test]
    fn test_decoder_rejects_foreign_format() {
        let mut decoder = FrameDecoder::new();
        let format = AudioFormat {
            sample_rate: 16000,
            channels: 1,
            codec: CodecKind::Pcm16,
        };
        assert!(decoder.decode(&[0, 0], format).is_err());

        let stereo = AudioFormat {
            channels: 2,
            ..AudioFormat::voice(CodecKind::Pcm16)
        };
        assert!(decoder.decode(&[0, 0], stereo).is_err());
    }

    #[test]
    fn test_frame_encoder_pcm_matches_raw() {
        let mut encoder = FrameEncoder::Pcm16;
        let samples = sine(0.25);
        assert_eq!(encoder.encode(&samples).unwrap(), pcm16_encode(&samples));
        assert_eq!(encoder.format(), AudioFormat::voice(CodecKind::Pcm16));
    }
}
