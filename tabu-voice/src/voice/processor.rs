//! WebRTC audio processor for voice enhancement
//!
//! Wraps the webrtc-audio-processing crate to provide:
//! - Automatic Gain Control (AGC)
//! - Noise Suppression (NS)
//! - Echo Cancellation (AEC)
//!
//! The processor works on 10ms chunks. A 60ms voice frame is processed as
//! six consecutive chunks.

use tabu_common::voice::{VOICE_CHANNELS, VOICE_SAMPLE_RATE};
use webrtc_audio_processing::{
    Config, EchoCancellation, EchoCancellationSuppressionLevel, GainControl, GainControlMode,
    InitializationConfig, NoiseSuppression, NoiseSuppressionLevel, Processor, VoiceDetection,
    VoiceDetectionLikelihood,
};

/// Samples per processor chunk (10ms at 48kHz)
pub const PROCESSOR_CHUNK_SAMPLES: usize = (VOICE_SAMPLE_RATE / 100) as usize;

// =============================================================================
// Audio Processor Settings
// =============================================================================

/// Settings for audio processing features
///
/// Default values are tuned for the common case of headphone users:
/// - Noise suppression ON: Removes background noise with minimal latency cost
/// - Echo cancellation OFF: Most users wear headphones; AEC adds latency and CPU overhead
/// - AGC ON: Normalizes volume levels across different microphones
/// - Transient suppression OFF: Can occasionally clip word beginnings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioProcessorSettings {
    /// Enable noise suppression (default: true)
    pub noise_suppression: bool,
    /// Enable echo cancellation (default: false)
    pub echo_cancellation: bool,
    /// Enable automatic gain control (default: true)
    pub agc: bool,
    /// Enable transient suppression (default: false)
    pub transient_suppression: bool,
}

impl Default for AudioProcessorSettings {
    fn default() -> Self {
        Self {
            noise_suppression: true,
            echo_cancellation: false,
            agc: true,
            transient_suppression: false,
        }
    }
}

impl AudioProcessorSettings {
    /// Whether any processing stage is enabled
    pub fn any_enabled(&self) -> bool {
        self.noise_suppression || self.echo_cancellation || self.agc || self.transient_suppression
    }
}

// =============================================================================
// Audio Processor
// =============================================================================

/// WebRTC audio processor for voice enhancement
pub struct AudioProcessor {
    /// The WebRTC audio processor instance
    processor: Processor,
    /// Current settings
    settings: AudioProcessorSettings,
}

impl AudioProcessor {
    /// Create a new audio processor with the given settings
    ///
    /// # Arguments
    /// * `settings` - Initial processor settings
    ///
    /// # Returns
    /// * `Ok(AudioProcessor)` - Processor ready for use
    /// * `Err(String)` - Error message if initialization failed
    pub fn new(settings: AudioProcessorSettings) -> Result<Self, String> {
        let init_config = InitializationConfig {
            num_capture_channels: VOICE_CHANNELS as i32,
            num_render_channels: VOICE_CHANNELS as i32,
            ..InitializationConfig::default()
        };

        let mut processor =
            Processor::new(&init_config).map_err(|e| format!("Failed to create processor: {e}"))?;
        processor.set_config(Self::build_config(&settings));

        Ok(Self {
            processor,
            settings,
        })
    }

    /// Build a Config from our settings
    fn build_config(settings: &AudioProcessorSettings) -> Config {
        Config {
            echo_cancellation: if settings.echo_cancellation {
                Some(EchoCancellation {
                    suppression_level: EchoCancellationSuppressionLevel::Moderate,
                    enable_extended_filter: true,
                    enable_delay_agnostic: true,
                    stream_delay_ms: None,
                })
            } else {
                None
            },
            gain_control: if settings.agc {
                Some(GainControl {
                    mode: GainControlMode::AdaptiveDigital,
                    target_level_dbfs: 3,
                    compression_gain_db: 9,
                    enable_limiter: true,
                })
            } else {
                None
            },
            noise_suppression: if settings.noise_suppression {
                Some(NoiseSuppression {
                    suppression_level: NoiseSuppressionLevel::Moderate,
                })
            } else {
                None
            },
            voice_detection: Some(VoiceDetection {
                detection_likelihood: VoiceDetectionLikelihood::High,
            }),
            enable_transient_suppressor: settings.transient_suppression,
            enable_high_pass_filter: true,
        }
    }

    /// Update processor settings dynamically
    pub fn update_settings(&mut self, settings: AudioProcessorSettings) {
        if settings != self.settings {
            self.processor.set_config(Self::build_config(&settings));
            self.settings = settings;
        }
    }

    pub fn settings(&self) -> AudioProcessorSettings {
        self.settings
    }

    /// Process a capture (microphone) frame in place
    ///
    /// # Arguments
    /// * `frame` - Audio frame, a whole number of 10ms chunks
    pub fn process_capture_frame(&mut self, frame: &mut [f32]) -> Result<(), String> {
        check_chunked(frame.len())?;
        for chunk in frame.chunks_exact_mut(PROCESSOR_CHUNK_SAMPLES) {
            self.processor
                .process_capture_frame(chunk)
                .map_err(|e| format!("Capture processing error: {e}"))?;
        }
        Ok(())
    }

    /// Process a render (speaker) frame
    ///
    /// Required for echo cancellation: the processor needs to know what is
    /// being played to remove it from the microphone signal. Trailing
    /// samples that do not fill a whole chunk are ignored.
    pub fn process_render_frame(&mut self, frame: &mut [f32]) -> Result<(), String> {
        for chunk in frame.chunks_exact_mut(PROCESSOR_CHUNK_SAMPLES) {
            self.processor
                .process_render_frame(chunk)
                .map_err(|e| format!("Render processing error: {e}"))?;
        }
        Ok(())
    }
}

fn check_chunked(len: usize) -> Result<(), String> {
    if len == 0 || len % PROCESSOR_CHUNK_SAMPLES != 0 {
        return Err(format!(
            "Expected a multiple of {} samples, got {}",
            PROCESSOR_CHUNK_SAMPLES, len
        ));
    }
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
