//! Audio device seams
//!
//! The capture and playback pipelines talk to devices only through these
//! traits. The cpal implementations live in `audio`; tests use in-memory
//! fakes. Devices are released when dropped.

use crate::error::{CaptureError, DeviceError};

/// Microphone stream delivering 48kHz mono f32 samples
pub trait CaptureDevice {
    /// Begin delivering samples
    fn start(&mut self) -> Result<(), DeviceError>;

    /// Take one full frame of samples, if buffered
    fn take_frame(&mut self) -> Option<Vec<f32>>;

    /// Number of full frames currently buffered
    fn pending_frames(&self) -> usize;

    /// First stream error reported by the audio thread, if any
    fn check_error(&mut self) -> Option<DeviceError>;

    /// Stop delivering samples and discard buffered audio
    fn stop(&mut self);
}

/// Output stream mixing one buffer per source
pub trait PlaybackDevice {
    /// Begin playback
    fn start(&mut self) -> Result<(), DeviceError>;

    /// Append samples for a source
    fn queue_audio(&mut self, source: &str, samples: &[f32]);

    /// Drop any buffered audio for a source
    fn remove_source(&mut self, source: &str);

    /// Drop all buffered audio
    fn clear(&mut self);

    /// First stream error reported by the audio thread, if any
    fn check_error(&mut self) -> Option<DeviceError>;
}

/// Opens audio devices by name (empty name = system default)
pub trait DeviceProvider {
    fn open_capture(&mut self, device_name: &str) -> Result<Box<dyn CaptureDevice>, CaptureError>;

    fn open_playback(&mut self, device_name: &str)
    -> Result<Box<dyn PlaybackDevice>, DeviceError>;
}
