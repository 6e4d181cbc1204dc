//! Server configuration.
//!
//! Supports loading from YAML files with environment variable overrides.

use std::net::IpAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

/// Server configuration loaded from YAML with environment overrides.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind the HTTP server to.
    /// Override: `ZONEAMP_BIND_ADDR`
    pub bind_addr: IpAddr,

    /// Port to bind the HTTP server to.
    /// Override: `ZONEAMP_BIND_PORT`
    pub bind_port: u16,

    /// Path of the persisted configuration snapshot.
    /// Override: `ZONEAMP_CONFIG_FILE`
    pub config_file: PathBuf,

    /// Use the mock runtime instead of the preamp board.
    pub mock_ctrl: bool,

    /// Use loopback stream drivers instead of player processes.
    pub mock_streams: bool,

    /// Coalesce snapshot saves instead of writing synchronously.
    pub delay_saves: bool,

    /// Amplifier unit count override (1-6); detected at boot if unset.
    pub units: Option<usize>,

    /// i2c character device for the preamp board.
    pub i2c_device: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let core = zoneamp_core::AppSettings::default();
        Self {
            bind_addr: IpAddr::from([0, 0, 0, 0]),
            bind_port: 8080,
            config_file: core.config_file,
            mock_ctrl: core.mock_ctrl,
            mock_streams: core.mock_streams,
            delay_saves: core.delay_saves,
            units: None,
            i2c_device: core.i2c_device,
        }
    }
}

impl ServerConfig {
    /// Loads configuration from a YAML file, then applies environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Applies environment variable overrides to the configuration.
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("ZONEAMP_BIND_ADDR") {
            if let Ok(addr) = val.parse() {
                self.bind_addr = addr;
            }
        }

        if let Ok(val) = std::env::var("ZONEAMP_BIND_PORT") {
            if let Ok(port) = val.parse() {
                self.bind_port = port;
            }
        }

        if let Ok(val) = std::env::var("ZONEAMP_CONFIG_FILE") {
            self.config_file = PathBuf::from(val);
        }
    }

    /// Converts to zoneamp-core's settings type.
    pub fn to_core_settings(&self) -> zoneamp_core::AppSettings {
        zoneamp_core::AppSettings {
            config_file: self.config_file.clone(),
            mock_ctrl: self.mock_ctrl,
            mock_streams: self.mock_streams,
            delay_saves: self.delay_saves,
            units: self.units,
            i2c_device: self.i2c_device.clone(),
            ..Default::default()
        }
    }
}
