//! Playback pipeline
//!
//! One decode chain per remote identity, created on its first frame. Each
//! chain reorders, decodes and applies gain before handing samples to the
//! shared output mixer. The output device is opened on the first playable
//! frame and released on teardown.

use std::collections::HashMap;
use std::time::Instant;

use tabu_common::voice::AudioFrame;

use crate::error::DeviceError;
use crate::voice::codec::FrameDecoder;
use crate::voice::device::{DeviceProvider, PlaybackDevice};
use crate::voice::reorder::ReorderBuffer;

/// Decode/output chain for one remote identity
struct PlaybackChain {
    decoder: FrameDecoder,
    reorder: ReorderBuffer<AudioFrame>,
    frames_played: u64,
    decode_errors: u64,
}

impl PlaybackChain {
    fn new() -> Self {
        Self {
            decoder: FrameDecoder::new(),
            reorder: ReorderBuffer::new(),
            frames_played: 0,
            decode_errors: 0,
        }
    }

    /// Decode released frames and apply gain
    fn render(&mut self, identity: &str, frames: Vec<AudioFrame>, gain: f32) -> Vec<f32> {
        let mut out = Vec::new();
        for frame in frames {
            match self.decoder.decode(frame.payload(), frame.format()) {
                Ok(samples) => {
                    out.extend(samples.into_iter().map(|s| apply_gain(s, gain)));
                    self.frames_played += 1;
                }
                Err(e) => {
                    self.decode_errors += 1;
                    tracing::warn!(
                        sender = identity,
                        codec = %frame.format().codec,
                        error = %e,
                        "dropping undecodable frame"
                    );
                }
            }
        }
        out
    }
}

/// Fixed gain followed by a hard clamp to [-1.0, 1.0]
pub fn apply_gain(sample: f32, gain: f32) -> f32 {
    (sample * gain).clamp(-1.0, 1.0)
}

/// Receives frames from remote speakers and plays them
pub struct PlaybackPipeline {
    local_identity: String,
    output_device_name: String,
    gain: f32,
    chains: HashMap<String, PlaybackChain>,
    output: Option<Box<dyn PlaybackDevice>>,
}

impl PlaybackPipeline {
    pub fn new(
        local_identity: impl Into<String>,
        output_device_name: impl Into<String>,
        gain: f32,
    ) -> Self {
        Self {
            local_identity: local_identity.into(),
            output_device_name: output_device_name.into(),
            gain,
            chains: HashMap::new(),
            output: None,
        }
    }

    /// Handle a frame received from `identity`
    ///
    /// Frames from the local identity are discarded. The output device is
    /// opened lazily; if that fails the frame is dropped and the error is
    /// returned so the caller can surface it (the next frame retries).
    ///
    /// # Returns
    /// The samples handed to the mixer by this call (may be empty).
    pub fn on_frame(
        &mut self,
        identity: &str,
        frame: AudioFrame,
        provider: &mut dyn DeviceProvider,
        now: Instant,
    ) -> Result<Vec<f32>, DeviceError> {
        if identity == self.local_identity || frame.sender_identity() == self.local_identity {
            tracing::trace!(sender = identity, "discarding self echo");
            return Ok(Vec::new());
        }

        self.ensure_output(provider)?;

        let chain = self.chains.entry(identity.to_string()).or_insert_with(|| {
            tracing::debug!(sender = identity, "creating playback chain");
            PlaybackChain::new()
        });
        let released = chain.reorder.push(frame.sequence(), frame, now);
        let samples = chain.render(identity, released, self.gain);

        if !samples.is_empty()
            && let Some(output) = self.output.as_mut()
        {
            output.queue_audio(identity, &samples);
        }
        Ok(samples)
    }

    /// Release frames that waited too long for a missing predecessor
    ///
    /// # Returns
    /// All samples handed to the mixer.
    pub fn tick(&mut self, now: Instant) -> Vec<f32> {
        let mut played = Vec::new();
        let gain = self.gain;
        for (identity, chain) in self.chains.iter_mut() {
            let released = chain.reorder.flush_expired(now);
            if released.is_empty() {
                continue;
            }
            let samples = chain.render(identity, released, gain);
            if let Some(output) = self.output.as_mut() {
                output.queue_audio(identity, &samples);
            }
            played.extend(samples);
        }
        played
    }

    /// Destroy the chain for an identity that left
    pub fn remove_identity(&mut self, identity: &str) {
        if self.chains.remove(identity).is_some() {
            tracing::debug!(sender = identity, "removed playback chain");
        }
        if let Some(output) = self.output.as_mut() {
            output.remove_source(identity);
        }
    }

    /// Clear all chains and release the output device
    pub fn teardown(&mut self) {
        self.chains.clear();
        if let Some(mut output) = self.output.take() {
            output.clear();
        }
    }

    /// Check the output device for stream errors
    ///
    /// On error the device is released (and reopened on the next frame).
    pub fn check_error(&mut self) -> Option<DeviceError> {
        let error = self.output.as_mut()?.check_error()?;
        self.output = None;
        Some(error)
    }

    pub fn set_gain(&mut self, gain: f32) {
        self.gain = gain;
    }

    pub fn has_output(&self) -> bool {
        self.output.is_some()
    }

    pub fn chain_count(&self) -> usize {
        self.chains.len()
    }

    pub fn has_chain(&self, identity: &str) -> bool {
        self.chains.contains_key(identity)
    }

    /// Frames played for an identity (0 if no chain)
    pub fn frames_played(&self, identity: &str) -> u64 {
        self.chains.get(identity).map_or(0, |c| c.frames_played)
    }

    fn ensure_output(&mut self, provider: &mut dyn DeviceProvider) -> Result<(), DeviceError> {
        if self.output.is_some() {
            return Ok(());
        }
        let mut output = provider.open_playback(&self.output_device_name)?;
        output.start()?;
        tracing::info!("output device acquired");
        self.output = Some(output);
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeDevices;
    use crate::voice::codec::pcm16_encode;
    use tabu_common::voice::{AudioFormat, CodecKind};

    fn pcm_frame(sender: &str, sequence: u32, value: f32) -> AudioFrame {
        AudioFrame::new(
            sender,
            sequence,
            sequence * 2880,
            pcm16_encode(&[value; 4]),
            AudioFormat::voice(CodecKind::Pcm16),
        )
    }

    #[test]
    fn test_apply_gain_clamps() {
        assert!((apply_gain(0.4, 1.25) - 0.5).abs() < 1e-6);
        assert_eq!(apply_gain(0.9, 1.25), 1.0);
        assert_eq!(apply_gain(-0.9, 1.25), -1.0);
    }

    #[test]
    fn test_output_acquired_lazily() {
        let devices = FakeDevices::new();
        let mut provider = devices.provider();
        let mut playback = PlaybackPipeline::new("veli", "", 1.25);
        assert!(!playback.has_output());
        assert_eq!(devices.playback_opened(), 0);

        let played = playback
            .on_frame("ali", pcm_frame("ali", 0, 0.4), &mut provider, Instant::now())
            .unwrap();
        assert_eq!(played.len(), 4);
        assert!((played[0] - 0.5).abs() < 1e-3);
        assert!(playback.has_output());
        assert_eq!(devices.playback_opened(), 1);
        assert_eq!(devices.queued_samples("ali"), 4);
    }

    #[test]
    fn test_self_echo_discarded() {
        let devices = FakeDevices::new();
        let mut provider = devices.provider();
        let mut playback = PlaybackPipeline::new("ali", "", 1.25);

        let played = playback
            .on_frame("ali", pcm_frame("ali", 0, 0.4), &mut provider, Instant::now())
            .unwrap();
        assert!(played.is_empty());
        assert!(!playback.has_output());
        assert_eq!(playback.chain_count(), 0);
    }

    #[test]
    fn test_one_chain_per_identity() {
        let devices = FakeDevices::new();
        let mut provider = devices.provider();
        let mut playback = PlaybackPipeline::new("veli", "", 1.0);
        let now = Instant::now();

        playback.on_frame("ali", pcm_frame("ali", 0, 0.1), &mut provider, now).unwrap();
        playback.on_frame("ali", pcm_frame("ali", 1, 0.1), &mut provider, now).unwrap();
        playback.on_frame("ayse", pcm_frame("ayse", 0, 0.1), &mut provider, now).unwrap();
        assert_eq!(playback.chain_count(), 2);
        assert_eq!(playback.frames_played("ali"), 2);

        playback.remove_identity("ali");
        assert!(!playback.has_chain("ali"));
        assert_eq!(devices.queued_samples("ali"), 0);
        assert_eq!(playback.chain_count(), 1);
    }

    #[test]
    fn test_undecodable_frame_isolated() {
        let devices = FakeDevices::new();
        let mut provider = devices.provider();
        let mut playback = PlaybackPipeline::new("veli", "", 1.0);
        let now = Instant::now();

        let broken = AudioFrame::new(
            "ali",
            0,
            0,
            vec![1, 2, 3],
            AudioFormat::voice(CodecKind::Pcm16),
        );
        assert!(playback.on_frame("ali", broken, &mut provider, now).unwrap().is_empty());
        // The chain keeps working for the next frame
        let played = playback
            .on_frame("ali", pcm_frame("ali", 1, 0.2), &mut provider, now)
            .unwrap();
        assert_eq!(played.len(), 4);
    }

    #[test]
    fn test_held_frame_flushed_on_tick() {
        let devices = FakeDevices::new();
        let mut provider = devices.provider();
        let mut playback = PlaybackPipeline::new("veli", "", 1.0);
        let start = Instant::now();

        playback.on_frame("ali", pcm_frame("ali", 0, 0.1), &mut provider, start).unwrap();
        let held = playback
            .on_frame("ali", pcm_frame("ali", 2, 0.1), &mut provider, start)
            .unwrap();
        assert!(held.is_empty());

        let flushed = playback.tick(start + crate::voice::reorder::max_hold());
        assert_eq!(flushed.len(), 4);
        assert_eq!(devices.queued_samples("ali"), 8);
    }

    #[test]
    fn test_teardown_releases_output() {
        let devices = FakeDevices::new();
        let mut provider = devices.provider();
        let mut playback = PlaybackPipeline::new("veli", "", 1.0);

        playback
            .on_frame("ali", pcm_frame("ali", 0, 0.1), &mut provider, Instant::now())
            .unwrap();
        playback.teardown();
        assert!(!playback.has_output());
        assert_eq!(playback.chain_count(), 0);
        assert_eq!(devices.playback_live(), 0);
    }

    #[test]
    fn test_output_failure_surfaces_and_retries() {
        let devices = FakeDevices::new();
        devices.fail_next_playback(DeviceError::NotFound("Speakers".into()));
        let mut provider = devices.provider();
        let mut playback = PlaybackPipeline::new("veli", "Speakers", 1.0);
        let now = Instant::now();

        let err = playback
            .on_frame("ali", pcm_frame("ali", 0, 0.1), &mut provider, now)
            .unwrap_err();
        assert_eq!(err, DeviceError::NotFound("Speakers".into()));
        assert!(!playback.has_output());

        assert!(playback.on_frame("ali", pcm_frame("ali", 1, 0.1), &mut provider, now).is_ok());
        assert!(playback.has_output());
    }
}
