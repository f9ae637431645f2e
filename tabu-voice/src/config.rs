//! Voice settings and persistence
//!
//! Settings are stored as pretty JSON in `voice.json` under the platform
//! config directory. Every field has a default so older or partial files
//! still load.

use std::fs;
#[cfg(unix)]
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tabu_common::APP_NAME;
use tabu_common::turn::TurnPolicy;
use tabu_common::voice::{CodecKind, VoiceQuality};

use crate::error::{Result, VoiceError};
use crate::transport::TransportStrategy;
use crate::voice::processor::AudioProcessorSettings;

// =============================================================================
// Constants
// =============================================================================

/// Settings file name
pub const SETTINGS_FILE_NAME: &str = "voice.json";

/// File permissions for the settings file on Unix (owner read/write only)
#[cfg(unix)]
const SETTINGS_FILE_MODE: u32 = 0o600;

/// System default device identifier
pub const SYSTEM_DEFAULT_DEVICE: &str = "";

/// Default peak amplitude below which a captured frame is not sent
pub const DEFAULT_SILENCE_THRESHOLD: f32 = 0.02;

/// Default gain applied to received audio before clamping
pub const DEFAULT_PLAYBACK_GAIN: f32 = 1.25;

/// Default time allowed for a link to connect
pub const DEFAULT_LINK_TIMEOUT_SECS: u64 = 10;

/// Default time the channel may stay down before full teardown
pub const DEFAULT_DISCONNECT_GRACE_SECS: u64 = 5;

/// Default number of outbound frames kept while the channel is down
pub const DEFAULT_BACKLOG_FRAMES: usize = 5;

/// Default local address for direct link sockets
pub const DEFAULT_LINK_BIND_ADDRESS: &str = "0.0.0.0";

// =============================================================================
// Voice Settings
// =============================================================================

/// Voice relay settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceSettings {
    /// Input device name (empty string = system default)
    #[serde(default)]
    pub input_device: String,

    /// Output device name (empty string = system default)
    #[serde(default)]
    pub output_device: String,

    /// Voice quality preset (affects Opus bitrate)
    #[serde(default)]
    pub voice_quality: VoiceQuality,

    /// Preferred codec (falls back to Pcm16 if Opus is unavailable)
    #[serde(default)]
    pub codec: CodecKind,

    /// Frame delivery strategy
    #[serde(default)]
    pub transport: TransportStrategy,

    /// Raw peak amplitude below which frames are not emitted
    #[serde(default = "default_silence_threshold")]
    pub silence_threshold: f32,

    /// Gain applied to received audio
    #[serde(default = "default_playback_gain")]
    pub playback_gain: f32,

    /// Enable noise suppression (default: true)
    #[serde(default = "default_true")]
    pub noise_suppression: bool,

    /// Enable echo cancellation (default: false, for headphone users)
    #[serde(default)]
    pub echo_cancellation: bool,

    /// Enable automatic gain control (default: true)
    #[serde(default = "default_true")]
    pub agc: bool,

    /// Enable transient (keyboard click) suppression
    #[serde(default)]
    pub transient_suppression: bool,

    /// Speaker and listener rules
    #[serde(default)]
    pub turn_policy: TurnPolicy,

    /// Start transmitting automatically when it becomes our turn
    #[serde(default)]
    pub auto_transmit: bool,

    /// Seconds a link may take to connect before it is restarted
    #[serde(default = "default_link_timeout_secs")]
    pub link_timeout_secs: u64,

    /// Seconds the channel may stay down before full teardown
    #[serde(default = "default_disconnect_grace_secs")]
    pub disconnect_grace_secs: u64,

    /// Outbound frames kept while the channel is down
    #[serde(default = "default_backlog_frames")]
    pub backlog_frames: usize,

    /// Local address direct link sockets bind to
    #[serde(default = "default_link_bind_address")]
    pub link_bind_address: String,
}

fn default_true() -> bool {
    true
}

fn default_silence_threshold() -> f32 {
    DEFAULT_SILENCE_THRESHOLD
}

fn default_playback_gain() -> f32 {
    DEFAULT_PLAYBACK_GAIN
}

fn default_link_timeout_secs() -> u64 {
    DEFAULT_LINK_TIMEOUT_SECS
}

fn default_disconnect_grace_secs() -> u64 {
    DEFAULT_DISCONNECT_GRACE_SECS
}

fn default_backlog_frames() -> usize {
    DEFAULT_BACKLOG_FRAMES
}

fn default_link_bind_address() -> String {
    DEFAULT_LINK_BIND_ADDRESS.to_string()
}

impl Default for VoiceSettings {
    fn default() -> Self {
        Self {
            input_device: SYSTEM_DEFAULT_DEVICE.to_string(),
            output_device: SYSTEM_DEFAULT_DEVICE.to_string(),
            voice_quality: VoiceQuality::default(),
            codec: CodecKind::default(),
            transport: TransportStrategy::default(),
            silence_threshold: DEFAULT_SILENCE_THRESHOLD,
            playback_gain: DEFAULT_PLAYBACK_GAIN,
            noise_suppression: true,
            echo_cancellation: false,
            agc: true,
            transient_suppression: false,
            turn_policy: TurnPolicy::default(),
            auto_transmit: false,
            link_timeout_secs: DEFAULT_LINK_TIMEOUT_SECS,
            disconnect_grace_secs: DEFAULT_DISCONNECT_GRACE_SECS,
            backlog_frames: DEFAULT_BACKLOG_FRAMES,
            link_bind_address: default_link_bind_address(),
        }
    }
}

impl VoiceSettings {
    /// Get the platform-specific settings file path
    ///
    /// Returns None if the config directory cannot be determined.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(APP_NAME).join(SETTINGS_FILE_NAME))
    }

    /// Load settings from `path`, or return defaults
    ///
    /// Falls back to defaults if the file doesn't exist, cannot be read,
    /// or contains invalid JSON.
    pub fn load(path: Option<PathBuf>) -> Self {
        let Some(path) = path.or_else(Self::default_path) else {
            return Self::default();
        };

        if !path.exists() {
            return Self::default();
        }

        match fs::read_to_string(&path)
            .map_err(VoiceError::from)
            .and_then(|contents| serde_json::from_str::<Self>(&contents).map_err(VoiceError::from))
        {
            Ok(settings) => settings.sanitized(),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "ignoring unreadable settings");
                Self::default()
            }
        }
    }

    /// Save settings to `path` with restrictive permissions
    ///
    /// Creates the parent directory if it doesn't exist. On Unix the file is
    /// set to 0o600 (owner read/write only).
    pub fn save(&self, path: Option<PathBuf>) -> Result<()> {
        let path = path
            .or_else(Self::default_path)
            .ok_or_else(|| VoiceError::Config("no config directory".to_string()))?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_string_pretty(self)?;
        fs::write(&path, json)?;

        #[cfg(unix)]
        Self::set_permissions(&path)?;

        Ok(())
    }

    #[cfg(unix)]
    fn set_permissions(path: &Path) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let mut perms = fs::metadata(path)?.permissions();
        perms.set_mode(SETTINGS_FILE_MODE);
        fs::set_permissions(path, perms)?;
        Ok(())
    }

    /// Clamp out-of-range values loaded from disk
    fn sanitized(mut self) -> Self {
        if !self.silence_threshold.is_finite() || self.silence_threshold < 0.0 {
            self.silence_threshold = DEFAULT_SILENCE_THRESHOLD;
        }
        if !self.playback_gain.is_finite() || self.playback_gain < 0.0 {
            self.playback_gain = DEFAULT_PLAYBACK_GAIN;
        }
        if self.link_timeout_secs == 0 {
            self.link_timeout_secs = DEFAULT_LINK_TIMEOUT_SECS;
        }
        self
    }

    /// Check if using system default input device
    pub fn is_default_input(&self) -> bool {
        self.input_device.is_empty()
    }

    /// Check if using system default output device
    pub fn is_default_output(&self) -> bool {
        self.output_device.is_empty()
    }

    /// Processing graph settings
    pub fn processor_settings(&self) -> AudioProcessorSettings {
        AudioProcessorSettings {
            noise_suppression: self.noise_suppression,
            echo_cancellation: self.echo_cancellation,
            agc: self.agc,
            transient_suppression: self.transient_suppression,
        }
    }

    pub fn link_timeout(&self) -> Duration {
        Duration::from_secs(self.link_timeout_secs)
    }

    pub fn disconnect_grace(&self) -> Duration {
        Duration::from_secs(self.disconnect_grace_secs)
    }
}

// =============================================================================
// Tests
// =============================================================================
