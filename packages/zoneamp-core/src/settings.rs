//! Startup settings for the controller.

use std::path::PathBuf;

use serde::Deserialize;

/// Configuration fixed at boot.
///
/// The defaults run entirely in-process (mock runtime, loopback stream
/// drivers) so the API can be exercised on any machine; a real install
/// flips `mock_ctrl`/`mock_streams` off.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    /// Path of the persisted configuration snapshot.
    pub config_file: PathBuf,

    /// Use the mock runtime instead of the preamp board.
    pub mock_ctrl: bool,

    /// Use loopback stream drivers instead of player processes.
    pub mock_streams: bool,

    /// Coalesce snapshot saves instead of writing synchronously.
    pub delay_saves: bool,

    /// Amplifier unit count override; detected from the runtime if unset.
    pub units: Option<usize>,

    /// i2c character device the preamp board hangs off.
    pub i2c_device: String,

    /// Directory holding per-stream player runtime files.
    pub stream_dir: PathBuf,
}

impl Default for AppSettings {
    fn default() -> Self {
        AppSettings {
            config_file: PathBuf::from("house.json"),
            mock_ctrl: true,
            mock_streams: true,
            delay_saves: true,
            units: None,
            i2c_device: "/dev/i2c-1".to_string(),
            stream_dir: std::env::temp_dir().join("zoneamp-streams"),
        }
    }
}
