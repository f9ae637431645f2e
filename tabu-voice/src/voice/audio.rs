//! Audio device management and streaming
//!
//! Provides audio device enumeration, microphone capture, and a per-source
//! mixing output using the cpal crate for cross-platform audio I/O. Uses
//! f32 samples throughout for compatibility with WebRTC audio processing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{
    BuildStreamError, Device, FromSample, Host, Sample, SampleFormat, Stream, StreamConfig,
    SupportedStreamConfigRange,
};
use tabu_common::voice::{VOICE_SAMPLE_RATE, VOICE_SAMPLES_PER_FRAME};

use crate::error::{CaptureError, DeviceError};
use crate::voice::device::{CaptureDevice, DeviceProvider, PlaybackDevice};

// =============================================================================
// Constants
// =============================================================================

/// System default device display name
pub const SYSTEM_DEFAULT_DEVICE_NAME: &str = "System Default";

/// Maximum capture buffer size in frames (prevents unbounded growth if the engine stalls)
const MAX_CAPTURE_BUFFER_FRAMES: usize = 10;

/// Maximum playback buffer size per source in frames (prevents latency buildup)
const MAX_PLAYBACK_BUFFER_FRAMES: usize = 20;

/// Sample formats we can convert from/to
const SUPPORTED_FORMATS: [SampleFormat; 3] = [SampleFormat::F32, SampleFormat::I16, SampleFormat::U16];

// =============================================================================
// Audio Device
// =============================================================================

/// Represents an audio device (input or output)
#[derive(Debug, Clone)]
pub struct AudioDevice {
    /// Device name for display
    pub name: String,
    /// Whether this represents the system default device
    pub is_default: bool,
}

impl AudioDevice {
    pub fn new(name: String, is_default: bool) -> Self {
        Self { name, is_default }
    }

    pub fn system_default() -> Self {
        Self {
            name: SYSTEM_DEFAULT_DEVICE_NAME.to_string(),
            is_default: true,
        }
    }
}

impl std::fmt::Display for AudioDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)
    }
}

impl PartialEq for AudioDevice {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for AudioDevice {}

// =============================================================================
// Device Enumeration
// =============================================================================

fn get_host() -> Host {
    cpal::default_host()
}

fn collect_devices(devices: impl Iterator<Item = Device>) -> Vec<AudioDevice> {
    let mut list = vec![AudioDevice::system_default()];
    for device in devices {
        if let Ok(desc) = device.description() {
            let name = desc.name().to_string();
            if !list.iter().any(|d| d.name == name) {
                list.push(AudioDevice::new(name, false));
            }
        }
    }
    list
}

/// List available audio input devices ("System Default" first)
pub fn list_input_devices() -> Vec<AudioDevice> {
    match get_host().input_devices() {
        Ok(devices) => collect_devices(devices),
        Err(_) => vec![AudioDevice::system_default()],
    }
}

/// List available audio output devices ("System Default" first)
pub fn list_output_devices() -> Vec<AudioDevice> {
    match get_host().output_devices() {
        Ok(devices) => collect_devices(devices),
        Err(_) => vec![AudioDevice::system_default()],
    }
}

fn is_default_name(name: &str) -> bool {
    name.is_empty() || name == SYSTEM_DEFAULT_DEVICE_NAME
}

/// Find an input device by name, or return the default
fn find_input_device(name: &str) -> Option<Device> {
    let host = get_host();
    if is_default_name(name) {
        return host.default_input_device();
    }
    host.input_devices()
        .ok()?
        .find(|d| d.description().is_ok_and(|desc| desc.name() == name))
        .or_else(|| host.default_input_device())
}

/// Find an output device by name, or return the default
fn find_output_device(name: &str) -> Option<Device> {
    let host = get_host();
    if is_default_name(name) {
        return host.default_output_device();
    }
    host.output_devices()
        .ok()?
        .find(|d| d.description().is_ok_and(|desc| desc.name() == name))
        .or_else(|| host.default_output_device())
}

/// Pick a 48kHz config, preferring mono over stereo
///
/// # Returns
/// * `Ok((channels, format))` - Usable stream shape
/// * `Err(CaptureError::Device(NoAudioTracks))` - Device reports no channels at all
/// * `Err(CaptureError::UnsupportedFormat)` - No 48kHz config in a format we handle
fn select_config(
    configs: Vec<SupportedStreamConfigRange>,
) -> Result<(u16, SampleFormat), CaptureError> {
    if configs.iter().all(|c| c.channels() == 0) {
        return Err(DeviceError::NoAudioTracks.into());
    }

    for channels in [1u16, 2] {
        if let Some(cfg) = configs.iter().find(|c| {
            c.channels() == channels
                && c.min_sample_rate() <= VOICE_SAMPLE_RATE
                && c.max_sample_rate() >= VOICE_SAMPLE_RATE
                && SUPPORTED_FORMATS.contains(&c.sample_format())
        }) {
            return Ok((channels, cfg.sample_format()));
        }
    }

    let rates: Vec<String> = configs
        .iter()
        .map(|c| {
            if c.min_sample_rate() == c.max_sample_rate() {
                format!("{}Hz", c.min_sample_rate())
            } else {
                format!("{}-{}Hz", c.min_sample_rate(), c.max_sample_rate())
            }
        })
        .collect();
    Err(CaptureError::UnsupportedFormat(format!(
        "device doesn't support 48kHz mono/stereo, supports: {}",
        if rates.is_empty() {
            "unknown".to_string()
        } else {
            rates.join(", ")
        }
    )))
}

fn map_build_error(err: BuildStreamError) -> DeviceError {
    match err {
        BuildStreamError::DeviceNotAvailable => DeviceError::NotFound("device not available".into()),
        other => {
            let message = other.to_string();
            let lower = message.to_lowercase();
            if lower.contains("permission") || lower.contains("denied") {
                DeviceError::PermissionDenied(message)
            } else {
                DeviceError::Stream(message)
            }
        }
    }
}

// =============================================================================
// Audio Capture
// =============================================================================

/// Audio capture from microphone
///
/// Captures audio at 48kHz, downmixing stereo devices to mono.
pub struct AudioCapture {
    /// The cpal input stream (released on drop)
    stream: Stream,
    /// Buffer for captured audio samples (f32 normalized to -1.0..1.0)
    buffer: Arc<Mutex<Vec<f32>>>,
    /// Flag indicating if capture is active
    active: Arc<AtomicBool>,
    /// Receiver for audio stream errors
    error_rx: std_mpsc::Receiver<String>,
}

impl AudioCapture {
    /// Open the named input device
    ///
    /// # Arguments
    /// * `device_name` - Device name, or empty string for system default
    pub fn new(device_name: &str) -> Result<Self, CaptureError> {
        let device = find_input_device(device_name)
            .ok_or_else(|| DeviceError::NotFound(display_name(device_name)))?;

        let configs: Vec<_> = device
            .supported_input_configs()
            .map_err(|e| DeviceError::Stream(e.to_string()))?
            .collect();
        let (channels, sample_format) = select_config(configs)?;

        let config = StreamConfig {
            channels,
            sample_rate: VOICE_SAMPLE_RATE,
            buffer_size: cpal::BufferSize::Default,
        };

        let buffer = Arc::new(Mutex::new(Vec::with_capacity(
            VOICE_SAMPLES_PER_FRAME as usize * 4,
        )));
        let active = Arc::new(AtomicBool::new(false));
        let (error_tx, error_rx) = std_mpsc::channel();

        let shared = (buffer.clone(), active.clone(), error_tx);
        let stream = match sample_format {
            SampleFormat::F32 => build_input_stream::<f32>(&device, &config, shared),
            SampleFormat::I16 => build_input_stream::<i16>(&device, &config, shared),
            SampleFormat::U16 => build_input_stream::<u16>(&device, &config, shared),
            other => {
                return Err(CaptureError::UnsupportedFormat(format!(
                    "sample format {:?}",
                    other
                )));
            }
        }
        .map_err(map_build_error)?;

        tracing::debug!(channels, format = ?sample_format, "opened capture device");

        Ok(Self {
            stream,
            buffer,
            active,
            error_rx,
        })
    }
}

impl CaptureDevice for AudioCapture {
    fn start(&mut self) -> Result<(), DeviceError> {
        self.active.store(true, Ordering::SeqCst);
        self.stream
            .play()
            .map_err(|e| DeviceError::Stream(format!("failed to start capture: {}", e)))
    }

    fn take_frame(&mut self) -> Option<Vec<f32>> {
        let mut buffer = self.buffer.lock().ok()?;
        let frame_size = VOICE_SAMPLES_PER_FRAME as usize;
        if buffer.len() >= frame_size {
            Some(buffer.drain(..frame_size).collect())
        } else {
            None
        }
    }

    fn pending_frames(&self) -> usize {
        self.buffer
            .lock()
            .map(|b| b.len() / VOICE_SAMPLES_PER_FRAME as usize)
            .unwrap_or(0)
    }

    fn check_error(&mut self) -> Option<DeviceError> {
        self.error_rx.try_recv().ok().map(DeviceError::Stream)
    }

    fn stop(&mut self) {
        self.active.store(false, Ordering::SeqCst);
        let _ = self.stream.pause();
        if let Ok(mut buf) = self.buffer.lock() {
            buf.clear();
        }
    }
}

type InputShared = (
    Arc<Mutex<Vec<f32>>>,
    Arc<AtomicBool>,
    std_mpsc::Sender<String>,
);

/// Build an input stream that downmixes every channel to mono
fn build_input_stream<T>(
    device: &Device,
    config: &StreamConfig,
    (buffer, active, error_tx): InputShared,
) -> Result<Stream, BuildStreamError>
where
    T: Sample + cpal::SizedSample,
    f32: FromSample<T>,
{
    let channels = config.channels.max(1) as usize;
    device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            if active.load(Ordering::SeqCst)
                && let Ok(mut buf) = buffer.lock()
            {
                for chunk in data.chunks_exact(channels) {
                    let sum: f32 = chunk.iter().map(|&s| f32::from_sample(s)).sum();
                    buf.push(sum / channels as f32);
                }
                let max_size = VOICE_SAMPLES_PER_FRAME as usize * MAX_CAPTURE_BUFFER_FRAMES;
                if buf.len() > max_size {
                    let drain_count = buf.len() - max_size;
                    buf.drain(..drain_count);
                }
            }
        },
        move |err| {
            // Receiver may be gone during teardown
            let _ = error_tx.send(format!("audio capture error: {}", err));
        },
        None,
    )
}

// =============================================================================
// Audio Mixer
// =============================================================================

/// Shared state for the audio mixer (accessed from audio callback)
#[derive(Default)]
struct MixerState {
    /// Per-source sample buffers
    sources: HashMap<String, Vec<f32>>,
}

impl MixerState {
    /// Mix the next sample from every source
    ///
    /// Returns silence when no source has audio.
    fn mix(&self, index: usize) -> f32 {
        let mut mixed = 0.0f32;
        let mut has_audio = false;
        for samples in self.sources.values() {
            if let Some(&s) = samples.get(index) {
                mixed += s;
                has_audio = true;
            }
        }
        if has_audio { soft_clip(mixed) } else { 0.0 }
    }

    fn consume(&mut self, count: usize) {
        for samples in self.sources.values_mut() {
            let drain_count = count.min(samples.len());
            samples.drain(..drain_count);
        }
        self.sources.retain(|_, s| !s.is_empty());
    }
}

/// Mixes the streams of all remote speakers into one output
pub struct AudioMixer {
    /// The cpal output stream (released on drop)
    stream: Stream,
    /// Shared mixer state
    state: Arc<Mutex<MixerState>>,
    /// Flag indicating if playback is active
    active: Arc<AtomicBool>,
    /// Receiver for audio stream errors
    error_rx: std_mpsc::Receiver<String>,
}

impl AudioMixer {
    /// Open the named output device
    pub fn new(device_name: &str) -> Result<Self, DeviceError> {
        let device = find_output_device(device_name)
            .ok_or_else(|| DeviceError::NotFound(display_name(device_name)))?;

        let configs: Vec<_> = device
            .supported_output_configs()
            .map_err(|e| DeviceError::Stream(e.to_string()))?
            .collect();
        let (channels, sample_format) = select_config(configs).map_err(|e| match e {
            CaptureError::Device(device_error) => device_error,
            other => DeviceError::Stream(other.to_string()),
        })?;

        let config = StreamConfig {
            channels,
            sample_rate: VOICE_SAMPLE_RATE,
            buffer_size: cpal::BufferSize::Default,
        };

        let state = Arc::new(Mutex::new(MixerState::default()));
        let active = Arc::new(AtomicBool::new(false));
        let (error_tx, error_rx) = std_mpsc::channel();

        let shared = (state.clone(), active.clone(), error_tx);
        let stream = match sample_format {
            SampleFormat::F32 => build_mixer_stream::<f32>(&device, &config, shared),
            SampleFormat::I16 => build_mixer_stream::<i16>(&device, &config, shared),
            SampleFormat::U16 => build_mixer_stream::<u16>(&device, &config, shared),
            other => {
                return Err(DeviceError::Stream(format!(
                    "unsupported sample format {:?}",
                    other
                )));
            }
        }
        .map_err(map_build_error)?;

        tracing::debug!(channels, format = ?sample_format, "opened playback device");

        Ok(Self {
            stream,
            state,
            active,
            error_rx,
        })
    }
}

impl PlaybackDevice for AudioMixer {
    fn start(&mut self) -> Result<(), DeviceError> {
        self.active.store(true, Ordering::SeqCst);
        self.stream
            .play()
            .map_err(|e| DeviceError::Stream(format!("failed to start mixer: {}", e)))
    }

    fn queue_audio(&mut self, source: &str, samples: &[f32]) {
        if let Ok(mut state) = self.state.lock() {
            let buffer = state.sources.entry(source.to_string()).or_default();
            buffer.extend_from_slice(samples);

            let max_size = VOICE_SAMPLES_PER_FRAME as usize * MAX_PLAYBACK_BUFFER_FRAMES;
            if buffer.len() > max_size {
                let drain_count = buffer.len() - max_size;
                buffer.drain(..drain_count);
            }
        }
    }

    fn remove_source(&mut self, source: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.sources.remove(source);
        }
    }

    fn clear(&mut self) {
        if let Ok(mut state) = self.state.lock() {
            state.sources.clear();
        }
    }

    fn check_error(&mut self) -> Option<DeviceError> {
        self.error_rx.try_recv().ok().map(DeviceError::Stream)
    }
}

impl Drop for AudioMixer {
    fn drop(&mut self) {
        self.active.store(false, Ordering::SeqCst);
        let _ = self.stream.pause();
    }
}

type MixerShared = (
    Arc<Mutex<MixerState>>,
    Arc<AtomicBool>,
    std_mpsc::Sender<String>,
);

/// Build a mixer output stream, duplicating the mono mix to every channel
fn build_mixer_stream<T>(
    device: &Device,
    config: &StreamConfig,
    (state, active, error_tx): MixerShared,
) -> Result<Stream, BuildStreamError>
where
    T: Sample + cpal::SizedSample + FromSample<f32>,
{
    let channels = config.channels.max(1) as usize;
    device.build_output_stream(
        config,
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
            let state = if active.load(Ordering::SeqCst) {
                state.lock().ok()
            } else {
                None
            };
            let Some(mut state) = state else {
                for sample in data.iter_mut() {
                    *sample = T::from_sample(0.0f32);
                }
                return;
            };

            let frames = data.len() / channels;
            for (i, chunk) in data.chunks_exact_mut(channels).enumerate() {
                let sample = T::from_sample(state.mix(i));
                for dst in chunk.iter_mut() {
                    *dst = sample;
                }
            }
            state.consume(frames);
        },
        move |err| {
            let _ = error_tx.send(format!("mixer error: {}", err));
        },
        None,
    )
}

/// Soft clip function to prevent harsh digital clipping
///
/// Uses tanh-based soft clipping which smoothly limits the signal as it
/// approaches the maximum.
pub fn soft_clip(sample: f32) -> f32 {
    (sample * 0.7).tanh() / 0.7_f32.tanh()
}

fn display_name(device_name: &str) -> String {
    if is_default_name(device_name) {
        SYSTEM_DEFAULT_DEVICE_NAME.to_string()
    } else {
        device_name.to_string()
    }
}

// =============================================================================
// Device Provider
// =============================================================================

/// Opens real devices through cpal
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalDeviceProvider;

impl DeviceProvider for CpalDeviceProvider {
    fn open_capture(&mut self, device_name: &str) -> Result<Box<dyn CaptureDevice>, CaptureError> {
        Ok(Box::new(AudioCapture::new(device_name)?))
    }

    fn open_playback(
        &mut self,
        device_name: &str,
    ) -> Result<Box<dyn PlaybackDevice>, DeviceError> {
        Ok(Box::new(AudioMixer::new(device_name)?))
    }
}

// =============================================================================
// Tests
// =============================================================================
