//! Command-line argument parsing

use std::path::PathBuf;

use clap::Parser;
use tabu_common::DEFAULT_SERVER_URL;
use tabu_voice::transport::TransportStrategy;

/// Get default config path help text for current platform
fn default_config_help() -> String {
    #[cfg(target_os = "linux")]
    return "Settings file path (default: ~/.config/tabu-voice/voice.json)".to_string();

    #[cfg(target_os = "macos")]
    return "Settings file path (default: ~/Library/Application Support/tabu-voice/voice.json)"
        .to_string();

    #[cfg(target_os = "windows")]
    return "Settings file path (default: %APPDATA%\\tabu-voice\\voice.json)".to_string();

    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
    return "Settings file path (overrides platform default)".to_string();
}

/// Tabu voice relay
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Game server WebSocket URL
    #[arg(short, long, default_value = DEFAULT_SERVER_URL)]
    pub server: String,

    /// Room to join
    #[arg(short, long, default_value = "lobby")]
    pub room: String,

    /// Identity to join as (random if omitted)
    #[arg(short, long)]
    pub identity: Option<String>,

    /// Frame delivery strategy (relay or direct); overrides the settings file
    #[arg(long)]
    pub strategy: Option<TransportStrategy>,

    /// Settings file path (overrides platform default)
    #[arg(short, long, help = default_config_help())]
    pub config: Option<PathBuf>,

    /// Input device name; overrides the settings file
    #[arg(long)]
    pub input_device: Option<String>,

    /// Output device name; overrides the settings file
    #[arg(long)]
    pub output_device: Option<String>,

    /// Start transmitting automatically on our turn
    #[arg(long, default_value = "false")]
    pub auto_transmit: bool,

    /// List audio devices and exit
    #[arg(long, default_value = "false")]
    pub list_devices: bool,
}
