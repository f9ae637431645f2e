//! Capture pipeline
//!
//! Owns the microphone stream and the processing graph while the local
//! participant is transmitting. Each tick takes at most one frame, gates
//! silence on the raw samples, processes, encodes and hands the frame to a
//! bounded sink without blocking.

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use tabu_common::voice::{AudioFrame, CodecKind, VOICE_SAMPLES_PER_FRAME, VoiceQuality};

use crate::config::VoiceSettings;
use crate::error::CaptureError;
use crate::voice::codec::{FrameEncoder, negotiate_codec, peak_amplitude};
use crate::voice::device::{CaptureDevice, DeviceProvider};
use crate::voice::processor::{AudioProcessor, AudioProcessorSettings};

/// Buffered frames tolerated before the oldest are discarded
pub const MAX_BACKLOG_FRAMES: usize = 2;

/// Counters for one pipeline (kept across sessions)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureStats {
    pub frames_emitted: u64,
    pub frames_gated: u64,
    pub frames_dropped_backlog: u64,
    pub frames_dropped_backpressure: u64,
    pub encode_errors: u64,
}

/// Resources held while capture is active
struct CaptureSession {
    identity: String,
    device: Box<dyn CaptureDevice>,
    processor: Option<AudioProcessor>,
    encoder: FrameEncoder,
    sink: mpsc::Sender<AudioFrame>,
    first_sequence: u32,
    sequence: u32,
    timestamp: u32,
}

impl CaptureSession {
    fn advance_timestamp(&mut self) {
        self.timestamp = self.timestamp.wrapping_add(VOICE_SAMPLES_PER_FRAME);
    }
}

/// Microphone to encoded frames
///
/// Sequence numbers and timestamps continue across sessions so listeners
/// keep ordering a speaker's frames after a stop and restart.
pub struct CapturePipeline {
    device_name: String,
    codec: CodecKind,
    quality: VoiceQuality,
    silence_threshold: f32,
    processor_settings: AudioProcessorSettings,
    session: Option<CaptureSession>,
    next_sequence: u32,
    next_timestamp: u32,
    stats: CaptureStats,
}

impl CapturePipeline {
    pub fn new(settings: &VoiceSettings) -> Self {
        Self {
            device_name: settings.input_device.clone(),
            codec: settings.codec,
            quality: settings.voice_quality,
            silence_threshold: settings.silence_threshold,
            processor_settings: settings.processor_settings(),
            session: None,
            next_sequence: 0,
            next_timestamp: 0,
            stats: CaptureStats::default(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.session.is_some()
    }

    pub fn stats(&self) -> CaptureStats {
        self.stats
    }

    /// Codec of the active session
    pub fn codec(&self) -> Option<CodecKind> {
        self.session.as_ref().map(|s| s.encoder.codec())
    }

    pub fn has_processor(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.processor.is_some())
    }

    /// Acquire the microphone and start producing frames
    ///
    /// Either everything is acquired or nothing is: a device that opens but
    /// fails to start is dropped before returning.
    ///
    /// # Arguments
    /// * `identity` - Sender identity stamped on every frame
    /// * `sink` - Bounded channel receiving encoded frames
    /// * `provider` - Opens the capture device
    pub fn start(
        &mut self,
        identity: &str,
        sink: mpsc::Sender<AudioFrame>,
        provider: &mut dyn DeviceProvider,
    ) -> Result<(), CaptureError> {
        if self.session.is_some() {
            return Err(CaptureError::AlreadyRunning);
        }

        let mut device = provider.open_capture(&self.device_name)?;
        device.start()?;

        let processor = if self.processor_settings.any_enabled() {
            match AudioProcessor::new(self.processor_settings) {
                Ok(p) => Some(p),
                Err(e) => {
                    tracing::warn!(error = %e, "audio processing disabled");
                    None
                }
            }
        } else {
            None
        };

        let encoder = negotiate_codec(self.codec, self.quality);
        tracing::info!(
            identity,
            codec = %encoder.codec(),
            processing = processor.is_some(),
            "capture started"
        );

        self.session = Some(CaptureSession {
            identity: identity.to_string(),
            device,
            processor,
            encoder,
            sink,
            first_sequence: self.next_sequence,
            sequence: self.next_sequence,
            timestamp: self.next_timestamp,
        });
        Ok(())
    }

    /// Run one capture interval
    ///
    /// A device error stops capture and is returned.
    ///
    /// # Returns
    /// `true` if a frame was handed to the sink.
    pub fn tick(&mut self) -> Result<bool, CaptureError> {
        let Some(session) = self.session.as_mut() else {
            return Ok(false);
        };

        if let Some(error) = session.device.check_error() {
            tracing::error!(error = %error, "capture device failed");
            self.stop();
            return Err(error.into());
        }

        while session.device.pending_frames() > MAX_BACKLOG_FRAMES {
            if session.device.take_frame().is_none() {
                break;
            }
            session.advance_timestamp();
            self.stats.frames_dropped_backlog += 1;
        }

        let Some(mut samples) = session.device.take_frame() else {
            return Ok(false);
        };
        let timestamp = session.timestamp;
        session.advance_timestamp();

        if peak_amplitude(&samples) < self.silence_threshold {
            self.stats.frames_gated += 1;
            return Ok(false);
        }

        if let Some(processor) = session.processor.as_mut()
            && let Err(e) = processor.process_capture_frame(&mut samples)
        {
            tracing::debug!(error = %e, "capture processing skipped");
        }

        let payload = match session.encoder.encode(&samples) {
            Ok(payload) => payload,
            Err(e) => {
                self.stats.encode_errors += 1;
                tracing::warn!(error = %e, "dropping unencodable frame");
                return Ok(false);
            }
        };

        let frame = AudioFrame::new(
            session.identity.clone(),
            session.sequence,
            timestamp,
            payload,
            session.encoder.format(),
        );
        session.sequence = session.sequence.wrapping_add(1);

        match session.sink.try_send(frame) {
            Ok(()) => {
                self.stats.frames_emitted += 1;
                Ok(true)
            }
            Err(TrySendError::Full(_)) => {
                self.stats.frames_dropped_backpressure += 1;
                tracing::trace!("frame sink full, dropping frame");
                Ok(false)
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!("frame sink closed, stopping capture");
                self.stop();
                Ok(false)
            }
        }
    }

    /// Give the echo canceller the audio being played
    pub fn feed_render(&mut self, samples: &[f32]) {
        let Some(processor) = self.session.as_mut().and_then(|s| s.processor.as_mut()) else {
            return;
        };
        if !processor.settings().echo_cancellation {
            return;
        }
        let mut render = samples.to_vec();
        if let Err(e) = processor.process_render_frame(&mut render) {
            tracing::debug!(error = %e, "render analysis skipped");
        }
    }

    /// Release the device stream and processing graph
    ///
    /// # Returns
    /// `true` if a session was active.
    pub fn stop(&mut self) -> bool {
        let Some(mut session) = self.session.take() else {
            return false;
        };
        session.device.stop();
        self.next_sequence = session.sequence;
        self.next_timestamp = session.timestamp;
        tracing::info!(
            identity = %session.identity,
            frames = session.sequence.wrapping_sub(session.first_sequence),
            "capture stopped"
        );
        true
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

// =============================================================================
// Tests
// =============================================================================
